use crate::engine::api::{
    CommitApplier, CommitFuture, CommitReply, EngineConfig, EngineError, GroupInfo, LifeCycle,
    PeerConfig, PeerId, PeerRole, PeerStatus, PrimacyPublisher, PrimacyState, RaftEngine,
    RaftEngineFactory,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// An in-process, single-group engine: every submission commits immediately
// and is applied in order by one background task. Consensus is theoretically
// modelled rather than implemented, which is enough to exercise every
// coordination path (catch-up, pre-apply, replay after reset) without a
// network.
//
// The durable log lives in the factory, so an engine re-created after a
// primacy loss replays the full history into its fresh state machine.

struct ApplyJob {
    payload: Bytes,
    index: u64,
    ack: Option<oneshot::Sender<Result<CommitReply, EngineError>>>,
}

struct EngineState {
    life: LifeCycle,
    peers: Vec<PeerConfig>,
    unreachable: HashSet<PeerId>,
    commit_index: u64,
    apply_tx: Option<mpsc::UnboundedSender<ApplyJob>>,
    apply_task: Option<JoinHandle<()>>,
}

pub struct LocalRaftEngine {
    logger: slog::Logger,
    config: EngineConfig,
    applier: Arc<dyn CommitApplier>,
    primacy: PrimacyPublisher,
    log: Arc<Mutex<Vec<Bytes>>>,
    state: Mutex<EngineState>,
}

impl LocalRaftEngine {
    fn new(
        logger: slog::Logger,
        config: EngineConfig,
        applier: Arc<dyn CommitApplier>,
        primacy: PrimacyPublisher,
        log: Arc<Mutex<Vec<Bytes>>>,
    ) -> Arc<Self> {
        let peers = config.peers.clone();
        Arc::new(LocalRaftEngine {
            logger,
            config,
            applier,
            primacy,
            log,
            state: Mutex::new(EngineState {
                life: LifeCycle::New,
                peers,
                unreachable: HashSet::new(),
                commit_index: 0,
                apply_tx: None,
                apply_task: None,
            }),
        })
    }

    /// Test hook: pretend this peer stopped answering RPCs, so group info
    /// reports it unavailable.
    pub fn mark_unreachable(&self, peer: &PeerId) {
        let mut state = self.state.lock().expect("local engine state poisoned");
        state.unreachable.insert(peer.clone());
    }

    pub fn commit_index(&self) -> u64 {
        self.state
            .lock()
            .expect("local engine state poisoned")
            .commit_index
    }

    fn local_id(&self) -> PeerId {
        self.config.local_peer.id.clone()
    }

    async fn run_apply_loop(applier: Arc<dyn CommitApplier>, mut rx: mpsc::UnboundedReceiver<ApplyJob>) {
        while let Some(job) = rx.recv().await {
            applier.apply_committed(job.payload);
            if let Some(ack) = job.ack {
                let _ = ack.send(Ok(CommitReply {
                    log_index: job.index,
                }));
            }
        }
    }
}

#[async_trait::async_trait]
impl RaftEngine for LocalRaftEngine {
    fn life_cycle(&self) -> LifeCycle {
        self.state.lock().expect("local engine state poisoned").life
    }

    async fn start(&self) -> Result<(), EngineError> {
        let replayed = {
            let mut state = self.state.lock().expect("local engine state poisoned");
            if state.life != LifeCycle::New {
                return Err(EngineError::Fatal("engine started twice".to_string()));
            }
            state.life = LifeCycle::Starting;

            let (tx, rx) = mpsc::unbounded_channel();
            state.apply_task = Some(tokio::spawn(Self::run_apply_loop(
                Arc::clone(&self.applier),
                rx,
            )));

            // Replay the durable log into the fresh state machine before
            // accepting anything new.
            let log = self.log.lock().expect("local engine log poisoned");
            for (i, payload) in log.iter().enumerate() {
                let job = ApplyJob {
                    payload: payload.clone(),
                    index: (i + 1) as u64,
                    ack: None,
                };
                tx.send(job)
                    .map_err(|_| EngineError::Unavailable("apply task exited".to_string()))?;
            }
            state.commit_index = log.len() as u64;
            state.apply_tx = Some(tx);
            state.life = LifeCycle::Running;
            log.len()
        };
        slog::info!(
            self.logger,
            "Local engine started";
            "replayed_entries" => replayed,
            "peer" => %self.local_id()
        );
        // A single-group in-process engine always wins its own election.
        self.primacy.publish(PrimacyState::Primary);
        Ok(())
    }

    async fn close(&self) {
        let apply_task = {
            let mut state = self.state.lock().expect("local engine state poisoned");
            if state.life != LifeCycle::Running {
                return;
            }
            state.life = LifeCycle::Closing;
            state.apply_tx = None; // lets the apply loop drain and exit
            state.apply_task.take()
        };
        if let Some(task) = apply_task {
            if let Err(e) = task.await {
                slog::warn!(self.logger, "Apply task failed during close"; "error" => %e);
            }
        }
        let mut state = self.state.lock().expect("local engine state poisoned");
        state.life = LifeCycle::Closed;
        self.primacy.publish(PrimacyState::Standby);
        slog::info!(self.logger, "Local engine closed");
    }

    fn submit(&self, call_id: u64, payload: Bytes) -> Result<CommitFuture, EngineError> {
        let mut state = self.state.lock().expect("local engine state poisoned");
        if state.life != LifeCycle::Running {
            return Err(EngineError::Unavailable("engine is not running".to_string()));
        }
        let apply_tx = match &state.apply_tx {
            Some(tx) => tx.clone(),
            None => return Err(EngineError::Unavailable("apply task exited".to_string())),
        };

        let index = {
            let mut log = self.log.lock().expect("local engine log poisoned");
            log.push(payload.clone());
            log.len() as u64
        };
        state.commit_index = index;
        slog::trace!(self.logger, "Accepted submission"; "call_id" => call_id, "index" => index);

        let (ack, commit) = oneshot::channel();
        apply_tx
            .send(ApplyJob {
                payload,
                index,
                ack: Some(ack),
            })
            .map_err(|_| EngineError::Unavailable("apply task exited".to_string()))?;
        Ok(CommitFuture::new(commit))
    }

    fn group_info(&self) -> Result<GroupInfo, EngineError> {
        let state = self.state.lock().expect("local engine state poisoned");
        if state.life != LifeCycle::Running {
            return Err(EngineError::Unavailable("engine is not running".to_string()));
        }
        let local_id = self.local_id();
        let peers = state
            .peers
            .iter()
            .map(|peer| PeerStatus {
                peer: peer.clone(),
                last_contact: if peer.id == local_id {
                    None
                } else if state.unreachable.contains(&peer.id) {
                    Some(Duration::from_secs(3600))
                } else {
                    Some(Duration::ZERO)
                },
            })
            .collect();
        let mut commit_indices = HashMap::new();
        for peer in &state.peers {
            commit_indices.insert(peer.id.clone(), state.commit_index);
        }
        Ok(GroupInfo {
            role: PeerRole::Leader,
            leader_id: Some(local_id),
            peers,
            commit_indices,
        })
    }

    async fn set_configuration(&self, peers: Vec<PeerConfig>) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("local engine state poisoned");
        if state.life != LifeCycle::Running {
            return Err(EngineError::Unavailable("engine is not running".to_string()));
        }
        slog::info!(self.logger, "Configuration changed"; "peers" => peers.len());
        state.peers = peers;
        Ok(())
    }

    async fn transfer_leadership(
        &self,
        target: PeerId,
        _wait: Duration,
    ) -> Result<(), EngineError> {
        Err(EngineError::Unavailable(format!(
            "in-process engine cannot transfer leadership to {}",
            target
        )))
    }
}

/// Builds `LocalRaftEngine`s that share one durable log, so each engine
/// incarnation replays the history its predecessors accepted.
pub struct LocalRaftEngineFactory {
    logger: slog::Logger,
    log: Arc<Mutex<Vec<Bytes>>>,
    current: Mutex<Option<Arc<LocalRaftEngine>>>,
}

impl LocalRaftEngineFactory {
    pub fn new(logger: slog::Logger) -> Self {
        LocalRaftEngineFactory {
            logger,
            log: Arc::new(Mutex::new(Vec::new())),
            current: Mutex::new(None),
        }
    }

    /// The engine most recently created by this factory. Test hook.
    pub fn current(&self) -> Option<Arc<LocalRaftEngine>> {
        self.current
            .lock()
            .expect("local engine factory poisoned")
            .clone()
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().expect("local engine log poisoned").len()
    }
}

impl RaftEngineFactory for LocalRaftEngineFactory {
    fn create(
        &self,
        config: EngineConfig,
        applier: Arc<dyn CommitApplier>,
        primacy: PrimacyPublisher,
    ) -> Arc<dyn RaftEngine> {
        let engine = LocalRaftEngine::new(
            self.logger.clone(),
            config,
            applier,
            primacy,
            Arc::clone(&self.log),
        );
        *self.current.lock().expect("local engine factory poisoned") = Some(Arc::clone(&engine));
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingApplier {
        applied: AtomicUsize,
    }

    impl CommitApplier for CountingApplier {
        fn apply_committed(&self, _payload: Bytes) {
            self.applied.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn engine_config() -> EngineConfig {
        let addr: SocketAddr = "127.0.0.1:19200".parse().unwrap();
        EngineConfig {
            group_id: Uuid::new_v4(),
            local_peer: PeerConfig::new(addr),
            peers: vec![PeerConfig::new(addr)],
            storage_dir: std::env::temp_dir(),
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn submissions_commit_and_apply_in_order() {
        let factory = LocalRaftEngineFactory::new(test_logger());
        let applier = Arc::new(CountingApplier {
            applied: AtomicUsize::new(0),
        });
        let (primacy, _rx) = PrimacyPublisher::new();
        let engine = factory.create(engine_config(), Arc::clone(&applier) as _, primacy);

        engine.start().await.unwrap();
        for i in 0..5u64 {
            let reply = engine
                .submit(i, Bytes::from_static(b"entry"))
                .unwrap()
                .wait_committed()
                .await
                .unwrap();
            assert_eq!(reply.log_index, i + 1);
        }
        assert_eq!(applier.applied.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn recreated_engine_replays_shared_log() {
        let factory = LocalRaftEngineFactory::new(test_logger());
        let (primacy, _rx) = PrimacyPublisher::new();

        let applier1 = Arc::new(CountingApplier {
            applied: AtomicUsize::new(0),
        });
        let engine1 = factory.create(engine_config(), Arc::clone(&applier1) as _, primacy.clone());
        engine1.start().await.unwrap();
        for i in 0..3u64 {
            engine1
                .submit(i, Bytes::from_static(b"entry"))
                .unwrap()
                .wait_committed()
                .await
                .unwrap();
        }
        engine1.close().await;

        let applier2 = Arc::new(CountingApplier {
            applied: AtomicUsize::new(0),
        });
        let engine2 = factory.create(engine_config(), Arc::clone(&applier2) as _, primacy);
        engine2.start().await.unwrap();
        // Replay is async; wait for it to land.
        tokio::time::timeout(Duration::from_secs(5), async {
            while applier2.applied.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn submit_after_close_is_unavailable() {
        let factory = LocalRaftEngineFactory::new(test_logger());
        let applier = Arc::new(CountingApplier {
            applied: AtomicUsize::new(0),
        });
        let (primacy, mut rx) = PrimacyPublisher::new();
        let engine = factory.create(engine_config(), applier as _, primacy);

        engine.start().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), PrimacyState::Primary);
        engine.close().await;
        assert_eq!(*rx.borrow_and_update(), PrimacyState::Standby);
        assert_eq!(engine.life_cycle(), LifeCycle::Closed);

        let err = engine.submit(0, Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
