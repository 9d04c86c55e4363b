mod api;
mod local;

pub use api::CommitApplier;
pub use api::CommitFuture;
pub use api::CommitReply;
pub use api::EngineConfig;
pub use api::EngineError;
pub use api::GroupInfo;
pub use api::LifeCycle;
pub use api::PeerConfig;
pub use api::PeerId;
pub use api::PeerRole;
pub use api::PeerStatus;
pub use api::PrimacyPublisher;
pub use api::PrimacyState;
pub use api::RaftEngine;
pub use api::RaftEngineFactory;
pub use local::LocalRaftEngine;
pub use local::LocalRaftEngineFactory;
