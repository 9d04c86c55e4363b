mod admin;
mod options;
mod system;

pub use admin::AdminError;
pub use admin::QuorumServerInfo;
pub use admin::QuorumServerState;
pub use options::JournalOptions;
pub use system::CheckpointError;
pub use system::GainPrimacyError;
pub use system::JournalSystemError;
pub use system::RaftJournalSystem;
pub use system::RaftJournalSystemConfig;
