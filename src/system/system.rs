use crate::engine::{
    CommitApplier, EngineConfig, EngineError, LifeCycle, PeerConfig, PrimacyPublisher,
    PrimacyState, RaftEngine, RaftEngineFactory,
};
use crate::journal::{
    Journal, JournalEntry, JournalRegistry, Master, RegistryError, SequenceNumber,
};
use crate::machine::{CatchupFuture, JournalStateMachine, SnapshotError, SnapshotGate, SuspendError};
use crate::system::options::{JournalOptions, JournalOptionsValidated};
use crate::writer::{AsyncJournalWriter, RaftJournalWriter, WriterSlot};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

// Every deployment shares one well-known group id; peers discover each
// other by address, not by group.
const RAFT_GROUP_UUID: Uuid = Uuid::from_u128(0x02511d47_d67c_49a3_9011_abb3109a44c1);

// Subdirectory of the journal dir that holds the engine's storage.
const RAFT_DIR_NAME: &str = "raft_journal";

// Where the state machine keeps local snapshots, inside the engine dir.
const SNAPSHOT_DIR_NAME: &str = "sm";

pub struct RaftJournalSystemConfig {
    pub journal_dir: PathBuf,
    pub local_addr: SocketAddr,
    pub cluster_addrs: Vec<SocketAddr>,
    pub info_logger: slog::Logger,
    pub options: JournalOptions,
}

pub(crate) struct SystemState {
    pub machine: Arc<JournalStateMachine>,
    pub engine: Arc<dyn RaftEngine>,
    raft_writer: Option<Arc<RaftJournalWriter>>,
    async_writer: Option<Arc<AsyncJournalWriter>>,
}

impl SystemState {
    pub(crate) fn has_writer(&self) -> bool {
        self.raft_writer.is_some()
    }
}

/// RaftJournalSystem multiplexes many logical master journals into a
/// single log replicated by an external consensus engine.
///
/// Two behaviors distinguish it from a vanilla replicated state machine:
///
/// 1. Pre-apply: the primary mutates master state *before* journaling, so
///    committed entries delivered back to the primary are bookkeeping-only
///    no-ops. A peer proves it is safe to serve (that it has drained every
///    entry from prior terms) by appending a random negative-SN sentinel
///    and watching its own state machine apply it.
/// 2. Snapshot control: snapshots are prohibited while the primary serves
///    writes, because an engine-chosen snapshot point could land in the
///    middle of a pre-applied mutation. The snapshot gate encodes this.
///
/// Losing primacy tears the writer stack down and rebuilds the engine and
/// state machine from scratch; a pre-applied mutation whose entry never
/// committed would otherwise poison the replay path.
pub struct RaftJournalSystem {
    pub(crate) logger: slog::Logger,
    journal_dir: PathBuf,
    local_peer: PeerConfig,
    cluster_addrs: Vec<SocketAddr>,
    pub(crate) options: JournalOptionsValidated,
    registry: Arc<JournalRegistry>,
    gate: Arc<SnapshotGate>,
    engine_factory: Arc<dyn RaftEngineFactory>,
    call_ids: Arc<AtomicU64>,
    primacy_publisher: PrimacyPublisher,
    primacy: watch::Receiver<PrimacyState>,
    writer_slot: WriterSlot,
    pub(crate) transfer_allowed: Arc<AtomicBool>,
    pub(crate) transfer_errors: Arc<StdMutex<HashMap<Uuid, String>>>,
    pub(crate) state: Mutex<Option<SystemState>>,
}

impl RaftJournalSystem {
    pub fn create(
        config: RaftJournalSystemConfig,
        engine_factory: Arc<dyn RaftEngineFactory>,
    ) -> Result<Self, JournalSystemError> {
        if !config.cluster_addrs.contains(&config.local_addr) {
            return Err(JournalSystemError::LocalNotInCluster(config.local_addr));
        }
        let options =
            JournalOptionsValidated::for_cluster(config.options, config.cluster_addrs.len())
                .map_err(JournalSystemError::IllegalOptions)?;
        let (primacy_publisher, primacy) = PrimacyPublisher::new();

        Ok(RaftJournalSystem {
            logger: config.info_logger,
            journal_dir: config.journal_dir,
            local_peer: PeerConfig::new(config.local_addr),
            cluster_addrs: config.cluster_addrs,
            options,
            registry: Arc::new(JournalRegistry::new()),
            gate: Arc::new(SnapshotGate::new(true)),
            engine_factory,
            call_ids: Arc::new(AtomicU64::new(0)),
            primacy_publisher,
            primacy,
            writer_slot: Arc::new(std::sync::RwLock::new(None)),
            transfer_allowed: Arc::new(AtomicBool::new(false)),
            transfer_errors: Arc::new(StdMutex::new(HashMap::new())),
            state: Mutex::new(None),
        })
    }

    pub fn raft_group_id() -> Uuid {
        RAFT_GROUP_UUID
    }

    pub(crate) fn local_peer(&self) -> &PeerConfig {
        &self.local_peer
    }

    pub(crate) fn cluster_addrs(&self) -> &[SocketAddr] {
        &self.cluster_addrs
    }

    pub(crate) fn next_call_id(&self) -> u64 {
        self.call_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a master and returns its append handle. Register every
    /// master before `start()`, or it will miss replay.
    pub fn create_journal(&self, master: Arc<dyn Master>) -> Result<Journal, RegistryError> {
        let name = master.name().to_string();
        self.registry.register(master)?;
        Ok(Journal::new(name, Arc::clone(&self.writer_slot)))
    }

    /// Observers see `Primary` after this peer wins an election and
    /// `Standby` after it loses one (or shuts down). The host reacts by
    /// calling `gain_primacy` / `lose_primacy`.
    pub fn primacy_states(&self) -> watch::Receiver<PrimacyState> {
        self.primacy_publisher.subscribe()
    }

    pub async fn start(&self) -> Result<(), JournalSystemError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(JournalSystemError::AlreadyStarted);
        }
        slog::info!(
            self.logger,
            "Starting raft journal system";
            "journal_dir" => %self.journal_dir.display(),
            "local" => %self.local_peer.addr,
            "cluster_size" => self.cluster_addrs.len()
        );

        fs::create_dir_all(&self.journal_dir)?;
        self.maybe_migrate_old_journal()?;
        fs::create_dir_all(self.engine_storage_dir())?;

        let (machine, engine) = self.init_engine()?;
        engine.start().await?;
        self.join_quorum(engine.as_ref()).await;

        *state = Some(SystemState {
            machine,
            engine,
            raft_writer: None,
            async_writer: None,
        });
        slog::info!(self.logger, "Raft journal system started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), JournalSystemError> {
        let mut state = self.state.lock().await;
        let state = match state.take() {
            Some(state) => state,
            None => return Ok(()),
        };
        slog::info!(self.logger, "Shutting down raft journal system");
        *self
            .writer_slot
            .write()
            .expect("journal writer slot lock poisoned") = None;
        if let Some(async_writer) = &state.async_writer {
            async_writer.close().await;
        }
        if let Some(raft_writer) = &state.raft_writer {
            raft_writer.close().await;
        }
        state.machine.set_closing();
        state.engine.close().await;
        slog::info!(self.logger, "Journal shutdown complete");
        Ok(())
    }

    /// Executed when the engine reports this peer won the election.
    ///
    /// Prohibits snapshots, proves log drainage via catch-up, upgrades the
    /// state machine to serve mode, and installs the writer stack. Errors
    /// propagate so the host can step the engine down and re-elect.
    pub async fn gain_primacy(&self) -> Result<(), GainPrimacyError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(GainPrimacyError::NotStarted)?;
        if state.raft_writer.is_some() {
            // At most one writer may ever exist per primacy epoch.
            slog::warn!(self.logger, "Ignoring gain_primacy; writer already installed");
            return Ok(());
        }
        slog::info!(self.logger, "Gaining primacy");

        self.gate.set_allowed(false);
        self.catch_up(&state.machine, &state.engine).await?;

        let next_sn = state.machine.upgrade().next();
        let raft_writer = Arc::new(RaftJournalWriter::new(
            self.logger.new(slog::o!("component" => "journal-writer")),
            Arc::clone(&state.engine),
            Arc::clone(&self.call_ids),
            next_sn,
            self.options.max_entry_bytes,
            self.options.max_inflight_bytes,
        ));
        let async_writer = AsyncJournalWriter::spawn(
            self.logger.new(slog::o!("component" => "async-writer")),
            Arc::clone(&raft_writer),
            self.options.writer_queue_depth,
        );
        state.raft_writer = Some(raft_writer);
        state.async_writer = Some(Arc::clone(&async_writer));
        *self
            .writer_slot
            .write()
            .expect("journal writer slot lock poisoned") = Some(async_writer);

        self.transfer_allowed.store(true, Ordering::SeqCst);
        slog::info!(self.logger, "Gained primacy"; "next_sn" => next_sn.val());
        Ok(())
    }

    /// Executed when the engine reports this peer lost the election.
    ///
    /// Fully tears down the writer stack, then closes and re-creates the
    /// engine together with a brand new state machine. The full reset is
    /// what makes standby replay trustworthy again: pre-applied state from
    /// the lost primacy is discarded wholesale.
    pub async fn lose_primacy(&self) -> Result<(), JournalSystemError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(JournalSystemError::NotStarted)?;
        if state.engine.life_cycle() != LifeCycle::Running {
            // Engine already went down through another path; don't shut
            // down twice.
            return Ok(());
        }
        slog::info!(self.logger, "Losing primacy");
        self.transfer_allowed.store(false, Ordering::SeqCst);

        // Async writer first, so pending entries flush through the raft
        // writer before it closes.
        *self
            .writer_slot
            .write()
            .expect("journal writer slot lock poisoned") = None;
        if let Some(async_writer) = state.async_writer.take() {
            async_writer.close().await;
        }
        if let Some(raft_writer) = state.raft_writer.take() {
            raft_writer.close().await;
        }

        slog::info!(self.logger, "Shutting down engine after losing primacy");
        state.engine.close().await;

        self.gate.set_allowed(true);
        let (machine, engine) = self.init_engine()?;
        engine.start().await.map_err(|e| {
            slog::crit!(
                self.logger,
                "Failed to restart engine while stepping down";
                "error" => %e
            );
            JournalSystemError::EngineRestart(e)
        })?;
        state.machine = machine;
        state.engine = engine;
        slog::info!(self.logger, "Engine restarted; now standby");
        Ok(())
    }

    /// Stops dispatching committed entries to masters so an external
    /// catch-up can own their state. Snapshots are prohibited for the
    /// duration: we cannot know what state the import left behind.
    pub async fn suspend(
        &self,
        on_interrupt: Box<dyn FnOnce() + Send>,
    ) -> Result<(), JournalSystemError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(JournalSystemError::NotStarted)?;
        self.gate.set_allowed(false);
        state.machine.suspend(on_interrupt)?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), JournalSystemError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(JournalSystemError::NotStarted)?;
        let result = state.machine.resume();
        self.gate.set_allowed(true);
        result.map_err(JournalSystemError::from)
    }

    pub async fn is_suspended(&self) -> bool {
        match self.state.lock().await.as_ref() {
            Some(state) => state.machine.is_suspended(),
            None => false,
        }
    }

    /// Completion handle for "has this peer applied up to `target` yet".
    pub async fn catchup(&self, target: SequenceNumber) -> Result<CatchupFuture, JournalSystemError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(JournalSystemError::NotStarted)?;
        Ok(state.machine.catchup(target))
    }

    /// The current global sequence number, reported once per registered
    /// journal. The log is a single stream, so every journal reports the
    /// same value.
    pub async fn current_sequence_numbers(
        &self,
    ) -> Result<HashMap<String, i64>, JournalSystemError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(JournalSystemError::NotStarted)?;
        let global = state.machine.last_applied_sn();
        Ok(self
            .registry
            .names()
            .into_iter()
            .map(|name| (name, global))
            .collect())
    }

    /// Operator-triggered snapshot: the maintenance window on a serving
    /// primary. Opens the snapshot gate just long enough for one snapshot
    /// taken after a fresh catch-up, then closes it again.
    pub async fn checkpoint(&self) -> Result<SequenceNumber, CheckpointError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(CheckpointError::NotStarted)?;
        self.gate.set_allowed(true);
        let result = async {
            self.catch_up(&state.machine, &state.engine)
                .await
                .map_err(|_| CheckpointError::SnapshotWait)?;
            Ok(state.machine.take_local_snapshot()?)
        }
        .await;
        self.gate.set_allowed(false);
        result
    }

    /// True iff the engine is running and reports this peer primary.
    pub async fn is_leader(&self) -> bool {
        match self.state.lock().await.as_ref() {
            Some(state) => {
                state.engine.life_cycle() == LifeCycle::Running
                    && *self.primacy.borrow() == PrimacyState::Primary
            }
            None => false,
        }
    }

    /// True iff this peer is primary and has never written an entry.
    pub async fn is_empty(&self) -> bool {
        match self.state.lock().await.as_ref() {
            Some(state) => match &state.raft_writer {
                Some(writer) => writer.next_sn().val() == 0,
                None => false,
            },
            None => false,
        }
    }

    pub fn is_formatted(&self) -> bool {
        self.journal_dir.exists()
    }

    /// Clears the journal directory, creating it if needed. Fails if the
    /// path cannot be made into an accessible directory.
    pub fn format(&self) -> Result<(), JournalSystemError> {
        let dir = &self.journal_dir;
        if dir.is_dir() {
            for dirent in fs::read_dir(dir)? {
                let path = dirent?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        } else {
            if dir.exists() {
                fs::remove_file(dir)?;
            }
            fs::create_dir_all(dir)?;
        }
        slog::info!(self.logger, "Formatted journal"; "dir" => %dir.display());
        Ok(())
    }

    // ------- internals --------

    fn engine_base_dir(&self) -> PathBuf {
        self.journal_dir.join(RAFT_DIR_NAME)
    }

    fn engine_storage_dir(&self) -> PathBuf {
        self.engine_base_dir().join(RAFT_GROUP_UUID.to_string())
    }

    // Older releases kept the group dir directly under the journal root.
    // Move it into place rather than replaying from scratch.
    fn maybe_migrate_old_journal(&self) -> io::Result<()> {
        let legacy = self.journal_dir.join(RAFT_GROUP_UUID.to_string());
        let base = self.engine_base_dir();
        if legacy.is_dir() && !base.exists() {
            slog::info!(
                self.logger,
                "Old journal layout detected, migrating";
                "from" => %legacy.display(),
                "to" => %base.display()
            );
            fs::create_dir_all(&base)?;
            fs::rename(&legacy, base.join(RAFT_GROUP_UUID.to_string()))?;
        }
        Ok(())
    }

    fn init_engine(
        &self,
    ) -> Result<(Arc<JournalStateMachine>, Arc<dyn RaftEngine>), JournalSystemError> {
        let machine = Arc::new(JournalStateMachine::create(
            self.logger.new(slog::o!("component" => "state-machine")),
            Arc::clone(&self.registry),
            Arc::clone(&self.gate),
            self.engine_storage_dir().join(SNAPSHOT_DIR_NAME),
        )?);
        let engine_config = EngineConfig {
            group_id: RAFT_GROUP_UUID,
            local_peer: self.local_peer.clone(),
            peers: self.cluster_addrs.iter().map(|a| PeerConfig::new(*a)).collect(),
            storage_dir: self.engine_storage_dir(),
            election_timeout_min: self.options.election_timeout_min,
            election_timeout_max: self.options.election_timeout_max,
            request_timeout: self.options.request_timeout,
        };
        let engine = self.engine_factory.create(
            engine_config,
            Arc::clone(&machine) as Arc<dyn CommitApplier>,
            self.primacy_publisher.clone(),
        );
        Ok((machine, engine))
    }

    // Ask the quorum to include us. A peer already in the group gets a
    // no-op; failures are survivable (we may simply be a later joiner
    // racing the first boot), so they only warn.
    async fn join_quorum(&self, engine: &dyn RaftEngine) {
        let info = match engine.group_info() {
            Ok(info) => info,
            Err(e) => {
                slog::warn!(self.logger, "Could not read group info while joining quorum"; "error" => %e);
                return;
            }
        };
        if info.peers.iter().any(|p| p.peer.id == self.local_peer.id) {
            return;
        }
        let mut peers: Vec<PeerConfig> = info.peers.into_iter().map(|p| p.peer).collect();
        peers.push(self.local_peer.clone());
        if let Err(e) = engine.set_configuration(peers).await {
            slog::warn!(self.logger, "Exception occurred while joining quorum"; "error" => %e);
        }
    }

    /// Loops until this peer convinces itself it has drained the log:
    ///
    /// 1. Append a unique negative-SN sentinel.
    /// 2. Wait for our own state machine to apply it. The engine cannot
    ///    apply a commit from an earlier term after one from a later term,
    ///    so seeing our sentinel proves everything before it was applied.
    /// 3. Require a quiet period (one max election timeout) in which
    ///    nothing else was applied. If another contender appended after
    ///    our sentinel, restart with a fresh one.
    ///
    /// Returns early (success) if the engine demotes us meanwhile; the
    /// follow-up `lose_primacy` tears everything down anyway.
    async fn catch_up(
        &self,
        machine: &Arc<JournalStateMachine>,
        engine: &Arc<dyn RaftEngine>,
    ) -> Result<(), GainPrimacyError> {
        let started = tokio::time::Instant::now();

        // A snapshot that began before we were elected may still be
        // streaming; entries cannot apply until it finishes.
        let snapshot_deadline = started + self.options.snapshot_wait_timeout;
        while machine.is_snapshotting() {
            if tokio::time::Instant::now() > snapshot_deadline {
                return Err(GainPrimacyError::SnapshotWait);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Best-effort baseline for replay progress logging.
        let end_commit_index = match engine.group_info() {
            Ok(info) => info.commit_indices.get(&self.local_peer.id).copied(),
            Err(e) => {
                slog::warn!(
                    self.logger,
                    "Failed to get commit info before replay; progress will not be reported";
                    "error" => %e,
                );
                None
            }
        };

        loop {
            if *self.primacy.borrow() != PrimacyState::Primary {
                slog::info!(self.logger, "No longer primary; abandoning catch-up");
                return Ok(());
            }

            let last_applied = machine.last_applied_sn();
            let sentinel = SequenceNumber::draw_sentinel();
            slog::info!(
                self.logger,
                "Performing catch-up";
                "last_applied_sn" => last_applied,
                "catchup_id" => sentinel.val()
            );

            let submit = engine.submit(
                self.next_call_id(),
                JournalEntry::sentinel(sentinel).encode(),
            );
            let committed = match submit {
                Ok(commit) => {
                    tokio::time::timeout(self.options.request_timeout, commit.wait_committed())
                        .await
                }
                Err(e) => Ok(Err(e)),
            };
            match committed {
                Ok(Ok(_)) => {}
                Ok(Err(EngineError::LeaderNotReady)) => {
                    // Engine is still replaying its own log.
                    self.log_replay_progress(machine, end_commit_index);
                    tokio::time::sleep(self.options.catchup_retry_wait).await;
                    continue;
                }
                Ok(Err(e)) => {
                    slog::info!(self.logger, "Exception submitting term start entry"; "error" => %e);
                    tokio::time::sleep(self.options.catchup_retry_wait).await;
                    continue;
                }
                Err(_elapsed) => {
                    slog::info!(self.logger, "Timed out submitting term start entry");
                    tokio::time::sleep(self.options.catchup_retry_wait).await;
                    continue;
                }
            }

            // Quiet period: our sentinel must be the last thing applied for
            // a full election timeout, so a stale leader has realized it
            // lost before we start assigning SNs.
            let deadline = tokio::time::Instant::now() + self.options.election_timeout_max;
            let mut settled = false;
            while tokio::time::Instant::now() <= deadline {
                if machine.last_applied_sn() == last_applied
                    && machine.last_primary_start_sn() == sentinel.val()
                {
                    settled = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if !settled {
                // Someone else committed after our sentinel; try again.
                continue;
            }

            slog::info!(
                self.logger,
                "Caught up";
                "elapsed_ms" => started.elapsed().as_millis() as u64,
                "last_applied_sn" => machine.last_applied_sn()
            );
            return Ok(());
        }
    }

    fn log_replay_progress(&self, machine: &JournalStateMachine, end_commit_index: Option<u64>) {
        match end_commit_index {
            Some(end) => slog::info!(
                self.logger,
                "Engine still replaying journal";
                "applied_sn" => machine.last_applied_sn(),
                "end_commit_index" => end
            ),
            None => slog::info!(
                self.logger,
                "Engine still replaying journal";
                "applied_sn" => machine.last_applied_sn()
            ),
        }
    }
}

impl std::fmt::Debug for RaftJournalSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftJournalSystem")
            .field("journal_dir", &self.journal_dir)
            .field("local", &self.local_peer.addr)
            .field("cluster", &self.cluster_addrs)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JournalSystemError {
    #[error("journal system already started")]
    AlreadyStarted,

    #[error("journal system is not started")]
    NotStarted,

    #[error("the cluster addresses must contain the local address ({0})")]
    LocalNotInCluster(SocketAddr),

    #[error("illegal journal options: {0}")]
    IllegalOptions(&'static str),

    #[error("journal storage failure")]
    Io(#[from] io::Error),

    #[error("engine failure")]
    Engine(#[from] EngineError),

    // Recovery is impossible without a process restart.
    #[error("fatal: failed to restart engine while stepping down")]
    EngineRestart(#[source] EngineError),

    #[error(transparent)]
    Suspend(#[from] SuspendError),
}

#[derive(Debug, thiserror::Error)]
pub enum GainPrimacyError {
    #[error("journal system is not started")]
    NotStarted,

    #[error("timed out waiting for an in-progress snapshot before catch-up")]
    SnapshotWait,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("journal system is not started")]
    NotStarted,

    #[error("could not catch up before snapshotting")]
    SnapshotWait,

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}
