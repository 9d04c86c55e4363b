use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Engine lifecycle, mirrored from the underlying consensus library.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LifeCycle {
    New,
    Starting,
    Running,
    Closing,
    Closed,
}

/// PeerId identifies a quorum member. Derived from the peer's address so
/// ids stay stable across restarts without extra coordination.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn from_addr(addr: &SocketAddr) -> Self {
        PeerId(format!("{}_{}", addr.ip(), addr.port()))
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerConfig {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub priority: u32,
}

impl PeerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        PeerConfig {
            id: PeerId::from_addr(&addr),
            addr,
            priority: 1,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerRole {
    Leader,
    Candidate,
    Follower,
}

/// Per-peer view reported by the leader. `last_contact` is the elapsed time
/// since the peer last answered an RPC; `None` means the peer is the local
/// one (or the engine has no estimate yet).
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer: PeerConfig,
    pub last_contact: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub role: PeerRole,
    pub leader_id: Option<PeerId>,
    pub peers: Vec<PeerStatus>,
    pub commit_indices: HashMap<PeerId, u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct CommitReply {
    pub log_index: u64,
}

/// CommitFuture resolves once the entry submitted alongside it is committed
/// by the quorum (not merely accepted by the leader). Futures for different
/// submissions may resolve out of order.
#[derive(Debug)]
pub struct CommitFuture {
    receiver: oneshot::Receiver<Result<CommitReply, EngineError>>,
}

impl CommitFuture {
    pub fn new(receiver: oneshot::Receiver<Result<CommitReply, EngineError>>) -> Self {
        CommitFuture { receiver }
    }

    pub async fn wait_committed(self) -> Result<CommitReply, EngineError> {
        match self.receiver.await {
            Ok(result) => result,
            // The engine dropped the pending commit, e.g. it was closed
            // while the entry was in flight.
            Err(_) => Err(EngineError::Unavailable("engine closed".to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // Typically means the engine is still replaying its log after election.
    #[error("leader is not ready to accept requests yet")]
    LeaderNotReady,

    #[error("this peer is not the leader")]
    NotLeader { leader: Option<PeerId> },

    #[error("engine request timed out")]
    Timeout,

    // Retry-cache collision or a full request queue. Safe to retry.
    #[error("engine is busy: {0}")]
    Busy(String),

    #[error("engine is unavailable: {0}")]
    Unavailable(String),

    #[error("engine I/O failure")]
    Io(#[from] io::Error),

    // An internal invariant was violated. The engine cannot continue; the
    // host decides whether to restart or abort.
    #[error("fatal engine fault: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether retrying with backoff is reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::LeaderNotReady | EngineError::Timeout | EngineError::Busy(_)
        )
    }
}

/// PrimacyState is this peer's role with respect to client writes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PrimacyState {
    Standby,
    Primary,
}

/// PrimacyPublisher is handed to the engine so it can announce election
/// outcomes. The paired receiver outlives engine resets: a re-created
/// engine publishes into the same channel.
#[derive(Clone)]
pub struct PrimacyPublisher {
    sender: Arc<watch::Sender<PrimacyState>>,
}

impl PrimacyPublisher {
    pub fn new() -> (Self, watch::Receiver<PrimacyState>) {
        let (tx, rx) = watch::channel(PrimacyState::Standby);
        (
            PrimacyPublisher {
                sender: Arc::new(tx),
            },
            rx,
        )
    }

    pub fn publish(&self, state: PrimacyState) {
        // Nobody listening is fine; the host may not care.
        let _ = self.sender.send(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<PrimacyState> {
        self.sender.subscribe()
    }
}

/// CommitApplier is the sink the engine drives: one call per committed
/// entry, in log order, from a single apply task.
pub trait CommitApplier: Send + Sync {
    fn apply_committed(&self, payload: Bytes);
}

/// RaftEngine is the contract the external consensus library must satisfy.
/// This crate never implements consensus itself; it coordinates around an
/// engine that does.
#[async_trait::async_trait]
pub trait RaftEngine: Send + Sync {
    fn life_cycle(&self) -> LifeCycle;

    async fn start(&self) -> Result<(), EngineError>;

    /// Close releases all engine resources. Pending submissions fail with
    /// `Unavailable`; the registered applier receives no further entries.
    async fn close(&self);

    /// Enqueues a payload for replication. The enqueue itself is
    /// synchronous and establishes log order: payloads appear in the log in
    /// `submit` call order. The returned future resolves on commit.
    fn submit(&self, call_id: u64, payload: Bytes) -> Result<CommitFuture, EngineError>;

    fn group_info(&self) -> Result<GroupInfo, EngineError>;

    /// Membership change: replaces the peer set (with priorities).
    async fn set_configuration(&self, peers: Vec<PeerConfig>) -> Result<(), EngineError>;

    /// Asks the engine to hand leadership to `target`, waiting up to `wait`
    /// for the transfer to be acknowledged.
    async fn transfer_leadership(&self, target: PeerId, wait: Duration) -> Result<(), EngineError>;
}

/// Everything an engine implementation needs to come up.
#[derive(Clone)]
pub struct EngineConfig {
    pub group_id: Uuid,
    pub local_peer: PeerConfig,
    pub peers: Vec<PeerConfig>,
    // The engine owns this directory; it is named by the group id and lives
    // under the journal directory.
    pub storage_dir: PathBuf,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub request_timeout: Duration,
}

/// RaftEngineFactory builds an engine bound to a state machine and a
/// primacy channel. The journal system constructs a fresh engine (and a
/// fresh state machine) every time primacy is lost, so the factory is
/// retained for the life of the system.
pub trait RaftEngineFactory: Send + Sync {
    fn create(
        &self,
        config: EngineConfig,
        applier: Arc<dyn CommitApplier>,
        primacy: PrimacyPublisher,
    ) -> Arc<dyn RaftEngine>;
}
