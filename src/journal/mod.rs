mod entry;
mod registry;

pub use entry::EntryCodecError;
pub use entry::JournalEntry;
pub use entry::SequenceNumber;
pub use registry::Journal;
pub use registry::JournalRegistry;
pub use registry::Master;
pub use registry::RegistryError;
