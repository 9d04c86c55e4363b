mod engine;
mod journal;
mod machine;
mod system;
mod writer;

pub use engine::CommitApplier;
pub use engine::CommitFuture;
pub use engine::CommitReply;
pub use engine::EngineConfig;
pub use engine::EngineError;
pub use engine::GroupInfo;
pub use engine::LifeCycle;
pub use engine::LocalRaftEngine;
pub use engine::LocalRaftEngineFactory;
pub use engine::PeerConfig;
pub use engine::PeerId;
pub use engine::PeerRole;
pub use engine::PeerStatus;
pub use engine::PrimacyPublisher;
pub use engine::PrimacyState;
pub use engine::RaftEngine;
pub use engine::RaftEngineFactory;
pub use journal::EntryCodecError;
pub use journal::Journal;
pub use journal::JournalEntry;
pub use journal::Master;
pub use journal::RegistryError;
pub use journal::SequenceNumber;
pub use machine::CatchupError;
pub use machine::CatchupFuture;
pub use machine::InstallSnapshotError;
pub use machine::SnapshotError;
pub use machine::SuspendError;
pub use system::AdminError;
pub use system::CheckpointError;
pub use system::GainPrimacyError;
pub use system::JournalOptions;
pub use system::JournalSystemError;
pub use system::QuorumServerInfo;
pub use system::QuorumServerState;
pub use system::RaftJournalSystem;
pub use system::RaftJournalSystemConfig;
pub use writer::AppendError;

// The crate root stays `mod` + `pub use` only: internals get organized
// freely, and the public surface is exactly this list.
