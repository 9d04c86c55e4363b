mod async_writer;
mod raft_writer;

pub use async_writer::AsyncJournalWriter;
pub use async_writer::WriterSlot;
pub use raft_writer::AppendError;
pub use raft_writer::PendingAppend;
pub use raft_writer::RaftJournalWriter;
