use crate::engine::CommitApplier;
use crate::journal::{JournalEntry, JournalRegistry, Master, SequenceNumber};
use crate::machine::{SnapshotGate, SnapshotRefused};
use bytes::Bytes;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// How many local snapshots we keep around before pruning old ones.
const SNAPSHOT_RETENTION: usize = 3;

const SNAPSHOT_PREFIX: &str = "snapshot-";

/// What the machine does with committed entries.
///
/// Replay is the standby behavior: every committed payload is dispatched to
/// its logical journal exactly once, in SN order. Serve is the primary
/// behavior after catch-up: the primary already mutated its state before
/// journaling, so committed entries only advance bookkeeping. Closing drops
/// everything while the engine shuts down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Replay,
    Serve,
    Closing,
}

struct Inner {
    mode: Mode,
    suspended: bool,
    // Entries that arrived while suspended, drained on resume (or on an
    // upgrade that aborts the suspension).
    buffered: Vec<JournalEntry>,
    on_interrupt: Option<Box<dyn FnOnce() + Send>>,
}

/// JournalStateMachine is the apply-side adapter between the consensus
/// engine and the masters: the sole consumer of committed entries, the sole
/// producer of local snapshots, and the installer of incoming ones.
///
/// One instance lives exactly as long as its engine. Losing primacy
/// replaces both together, which is what guarantees a standby replays from
/// clean state rather than on top of pre-applied mutations.
pub struct JournalStateMachine {
    logger: slog::Logger,
    registry: Arc<JournalRegistry>,
    gate: Arc<SnapshotGate>,
    snapshot_dir: PathBuf,
    // Highest SN reflected in the masters' state (or tracked while
    // serving). Published through a watch channel so catch-up futures can
    // wait on it without polling.
    applied: watch::Sender<i64>,
    last_primary_start_sn: AtomicI64,
    snapshotting: AtomicBool,
    inner: Mutex<Inner>,
}

impl JournalStateMachine {
    /// Builds a fresh state machine in replay mode: resets every master,
    /// then restores the newest on-disk snapshot if one exists. The engine
    /// replays the log on top of this; entries at or below the snapshot SN
    /// are skipped during replay.
    pub fn create(
        logger: slog::Logger,
        registry: Arc<JournalRegistry>,
        gate: Arc<SnapshotGate>,
        snapshot_dir: PathBuf,
    ) -> io::Result<Self> {
        fs::create_dir_all(&snapshot_dir)?;
        let machine = JournalStateMachine {
            logger,
            registry,
            gate,
            snapshot_dir,
            applied: watch::channel(-1).0,
            last_primary_start_sn: AtomicI64::new(0),
            snapshotting: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                mode: Mode::Replay,
                suspended: false,
                buffered: Vec::new(),
                on_interrupt: None,
            }),
        };

        machine.registry.reset_all();
        if let Some((path, sn)) = machine.newest_snapshot()? {
            slog::info!(
                machine.logger,
                "Restoring masters from local snapshot";
                "path" => %path.display(),
                "sn" => sn
            );
            let mut reader = BufReader::new(File::open(&path)?);
            machine
                .install_snapshot(&mut reader, SequenceNumber::new(sn))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        }
        Ok(machine)
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().expect("state machine lock poisoned").mode
    }

    pub fn last_applied_sn(&self) -> i64 {
        *self.applied.borrow()
    }

    pub fn last_primary_start_sn(&self) -> i64 {
        self.last_primary_start_sn.load(Ordering::SeqCst)
    }

    pub fn is_snapshotting(&self) -> bool {
        self.snapshotting.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().expect("state machine lock poisoned").suspended
    }

    /// Transitions replay -> serve and returns the SN the writer should
    /// resume after. Idempotent within a single primacy epoch. Aborts any
    /// in-progress suspension, since the suspension belongs to a standby
    /// that no longer exists.
    pub fn upgrade(&self) -> SequenceNumber {
        let mut inner = self.inner.lock().expect("state machine lock poisoned");
        match inner.mode {
            Mode::Serve => return SequenceNumber::new(self.last_applied_sn()),
            Mode::Closing => {
                slog::warn!(self.logger, "Ignoring upgrade() on a closing state machine");
                return SequenceNumber::new(self.last_applied_sn());
            }
            Mode::Replay => {}
        }
        if inner.suspended {
            slog::warn!(self.logger, "Upgrading a suspended state machine; aborting suspension");
            if let Some(on_interrupt) = inner.on_interrupt.take() {
                on_interrupt();
            }
            inner.suspended = false;
            let _mutation = self.gate.mutation_guard();
            for entry in std::mem::take(&mut inner.buffered) {
                self.replay_entry(entry);
            }
        }
        inner.mode = Mode::Serve;
        slog::info!(
            self.logger,
            "State machine upgraded to serve mode";
            "last_applied_sn" => self.last_applied_sn()
        );
        SequenceNumber::new(self.last_applied_sn())
    }

    /// Stops dispatching entries to masters until `resume`. Entries
    /// committed in the meantime are buffered. Used while an external
    /// catch-up (e.g. a checkpoint import) owns the masters' state.
    pub fn suspend(&self, on_interrupt: Box<dyn FnOnce() + Send>) -> Result<(), SuspendError> {
        let mut inner = self.inner.lock().expect("state machine lock poisoned");
        if inner.mode != Mode::Replay {
            return Err(SuspendError::NotStandby);
        }
        if inner.suspended {
            return Err(SuspendError::AlreadySuspended);
        }
        inner.suspended = true;
        inner.on_interrupt = Some(on_interrupt);
        slog::info!(self.logger, "State machine suspended");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SuspendError> {
        let mut inner = self.inner.lock().expect("state machine lock poisoned");
        if !inner.suspended {
            return Err(SuspendError::NotSuspended);
        }
        inner.suspended = false;
        inner.on_interrupt = None;
        let buffered = std::mem::take(&mut inner.buffered);
        slog::info!(
            self.logger,
            "State machine resuming";
            "buffered_entries" => buffered.len()
        );
        let _mutation = self.gate.mutation_guard();
        for entry in buffered {
            self.replay_entry(entry);
        }
        Ok(())
    }

    /// Marks the machine as shutting down; further applies are dropped.
    pub fn set_closing(&self) {
        let mut inner = self.inner.lock().expect("state machine lock poisoned");
        inner.mode = Mode::Closing;
    }

    /// Returns a future that completes once `last_applied_sn >= target`.
    /// A target at or below the current SN yields an already-complete
    /// future.
    pub fn catchup(&self, target: SequenceNumber) -> CatchupFuture {
        CatchupFuture {
            target: target.val(),
            rx: self.applied.subscribe(),
        }
    }

    /// Streams a consistent checkpoint of every master to local storage at
    /// the current `last_applied_sn`. Holds the snapshot gate's write side
    /// for the duration, so no apply can interleave.
    pub fn take_local_snapshot(&self) -> Result<SequenceNumber, SnapshotError> {
        let _guard = self.gate.snapshot_guard()?;
        self.snapshotting.store(true, Ordering::SeqCst);
        let result = self.write_snapshot();
        self.snapshotting.store(false, Ordering::SeqCst);
        match &result {
            Ok(sn) => {
                slog::info!(self.logger, "Took local snapshot"; "sn" => sn.val());
            }
            Err(e) => {
                slog::warn!(self.logger, "Local snapshot failed"; "error" => %e);
            }
        }
        result
    }

    /// Replaces every master's state from a checkpoint stream produced by
    /// `take_local_snapshot` on another peer, then jumps `last_applied_sn`
    /// to `sn`. Only legal in replay mode.
    pub fn install_snapshot(
        &self,
        reader: &mut dyn Read,
        sn: SequenceNumber,
    ) -> Result<(), InstallSnapshotError> {
        {
            let inner = self.inner.lock().expect("state machine lock poisoned");
            if inner.mode != Mode::Replay {
                return Err(InstallSnapshotError::NotInReplay);
            }
        }
        let _mutation = self.gate.mutation_guard();

        let mut count_buf = [0u8; 4];
        reader.read_exact(&mut count_buf)?;
        let count = u32::from_be_bytes(count_buf);
        for _ in 0..count {
            let mut len_buf = [0u8; 2];
            reader.read_exact(&mut len_buf)?;
            let mut name_buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            reader.read_exact(&mut name_buf)?;
            let name = String::from_utf8(name_buf)
                .map_err(|_| InstallSnapshotError::Corrupt("journal name is not UTF-8"))?;
            let mut data_len_buf = [0u8; 8];
            reader.read_exact(&mut data_len_buf)?;
            let data_len = u64::from_be_bytes(data_len_buf);

            let master = self
                .registry
                .get(&name)
                .ok_or(InstallSnapshotError::UnknownJournal(name))?;
            let mut section = (&mut *reader).take(data_len);
            master.restore(&mut section)?;
            if section.limit() != 0 {
                return Err(InstallSnapshotError::Corrupt("master left checkpoint bytes unread"));
            }
        }

        self.applied.send_replace(sn.val());
        Ok(())
    }

    fn write_snapshot(&self) -> Result<SequenceNumber, SnapshotError> {
        let sn = self.last_applied_sn();
        let final_path = self.snapshot_path(sn);
        let tmp_path = self.snapshot_dir.join(format!(".tmp-{}{}", SNAPSHOT_PREFIX, sn));

        let file = File::create(&tmp_path)?;
        let mut out = BufWriter::new(file);
        let masters = self.registry.masters();
        out.write_all(&(masters.len() as u32).to_be_bytes())?;
        for master in &masters {
            write_master_section(&mut out, master.as_ref())?;
        }
        out.flush()?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;

        self.prune_snapshots();
        Ok(SequenceNumber::new(sn))
    }

    fn snapshot_path(&self, sn: i64) -> PathBuf {
        self.snapshot_dir.join(format!("{}{}", SNAPSHOT_PREFIX, sn))
    }

    fn newest_snapshot(&self) -> io::Result<Option<(PathBuf, i64)>> {
        Ok(self.list_snapshots()?.into_iter().last())
    }

    // Snapshots sorted by ascending SN.
    fn list_snapshots(&self) -> io::Result<Vec<(PathBuf, i64)>> {
        let mut found = Vec::new();
        for dirent in fs::read_dir(&self.snapshot_dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(sn_str) = name.strip_prefix(SNAPSHOT_PREFIX) {
                if let Ok(sn) = sn_str.parse::<i64>() {
                    found.push((dirent.path(), sn));
                }
            }
        }
        found.sort_by_key(|(_, sn)| *sn);
        Ok(found)
    }

    fn prune_snapshots(&self) {
        let snapshots = match self.list_snapshots() {
            Ok(s) => s,
            Err(_) => return,
        };
        if snapshots.len() <= SNAPSHOT_RETENTION {
            return;
        }
        for (path, sn) in &snapshots[..snapshots.len() - SNAPSHOT_RETENTION] {
            if let Err(e) = fs::remove_file(path) {
                slog::warn!(self.logger, "Failed to prune old snapshot"; "sn" => *sn, "error" => %e);
            }
        }
    }

    fn process(&self, entry: JournalEntry) {
        let mut inner = self.inner.lock().expect("state machine lock poisoned");
        match inner.mode {
            Mode::Closing => {}
            _ if inner.suspended => inner.buffered.push(entry),
            Mode::Replay => self.replay_entry(entry),
            Mode::Serve => self.track_entry(entry),
        }
    }

    // Standby path: dispatch the payload to its logical journal.
    fn replay_entry(&self, entry: JournalEntry) {
        if entry.sn.is_sentinel() {
            slog::debug!(self.logger, "Observed term-start sentinel"; "sn" => entry.sn.val());
            self.last_primary_start_sn.store(entry.sn.val(), Ordering::SeqCst);
            return;
        }
        let sn = entry.sn.val();
        if sn <= self.last_applied_sn() {
            // Already reflected in the snapshot we restored from.
            return;
        }
        let name = match &entry.target {
            Some(name) => name,
            None => self.fatal("Committed entry has no target journal", None),
        };
        let master = match self.registry.get(name) {
            Some(master) => master,
            None => self.fatal(&format!("Committed entry targets unknown journal '{}'", name), None),
        };
        if let Err(e) = master.apply(entry.payload.clone()) {
            self.fatal(
                &format!("Master '{}' failed to apply entry {}", name, sn),
                Some(&*e),
            );
        }
        self.applied.send_replace(sn);
    }

    // Primary path: the payload was applied before it was journaled, so
    // only bookkeeping advances here.
    fn track_entry(&self, entry: JournalEntry) {
        let sn = entry.sn.val();
        if entry.sn.is_sentinel() {
            self.last_primary_start_sn.store(sn, Ordering::SeqCst);
        }
        self.applied.send_modify(|applied| *applied = (*applied).max(sn));
    }

    // The masters' state no longer matches the log. Continuing would
    // silently diverge this peer from the quorum; force a clean restart.
    fn fatal(&self, msg: &str, cause: Option<&(dyn std::error::Error + Send + Sync)>) -> ! {
        match cause {
            Some(e) => slog::crit!(self.logger, "{}", msg; "error" => %e),
            None => slog::crit!(self.logger, "{}", msg),
        }
        std::process::abort();
    }
}

impl CommitApplier for JournalStateMachine {
    fn apply_committed(&self, payload: Bytes) {
        let _mutation = self.gate.mutation_guard();
        match JournalEntry::decode(payload) {
            Ok(entry) => self.process(entry),
            Err(e) => self.fatal("Failed to decode committed journal entry", Some(&e)),
        }
    }
}

fn write_master_section(out: &mut dyn Write, master: &dyn Master) -> io::Result<()> {
    // Checkpoint into a buffer first so the section can be length-framed.
    let mut data = Vec::new();
    master.checkpoint(&mut data)?;
    let name = master.name().as_bytes();
    out.write_all(&(name.len() as u16).to_be_bytes())?;
    out.write_all(name)?;
    out.write_all(&(data.len() as u64).to_be_bytes())?;
    out.write_all(&data)?;
    Ok(())
}

/// Completion handle for `JournalStateMachine::catchup`.
pub struct CatchupFuture {
    target: i64,
    rx: watch::Receiver<i64>,
}

impl CatchupFuture {
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow() >= self.target
    }

    pub async fn wait(mut self) -> Result<(), CatchupError> {
        self.rx
            .wait_for(|applied| *applied >= self.target)
            .await
            .map(|_| ())
            .map_err(|_| CatchupError::MachineClosed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatchupError {
    #[error("state machine was closed before catching up")]
    MachineClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum SuspendError {
    #[error("only a standby in replay mode can be suspended")]
    NotStandby,

    #[error("state machine is already suspended")]
    AlreadySuspended,

    #[error("state machine is not suspended")]
    NotSuspended,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Refused(#[from] SnapshotRefused),

    #[error("snapshot I/O failure")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum InstallSnapshotError {
    #[error("snapshots can only be installed in replay mode")]
    NotInReplay,

    #[error("checkpoint stream targets unknown journal '{0}'")]
    UnknownJournal(String),

    #[error("corrupt checkpoint stream: {0}")]
    Corrupt(&'static str),

    #[error("checkpoint I/O failure")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    /// Master that records applied payloads; checkpoint/restore move the
    /// whole record through the stream.
    pub(crate) struct RecordingMaster {
        name: String,
        pub applied: StdMutex<VecDeque<Bytes>>,
    }

    impl RecordingMaster {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(RecordingMaster {
                name: name.to_string(),
                applied: StdMutex::new(VecDeque::new()),
            })
        }

        pub fn applied_payloads(&self) -> Vec<Bytes> {
            self.applied.lock().unwrap().iter().cloned().collect()
        }
    }

    impl Master for RecordingMaster {
        fn name(&self) -> &str {
            &self.name
        }

        fn apply(&self, payload: Bytes) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.applied.lock().unwrap().push_back(payload);
            Ok(())
        }

        fn checkpoint(&self, out: &mut dyn Write) -> io::Result<()> {
            let applied = self.applied.lock().unwrap();
            out.write_all(&(applied.len() as u32).to_be_bytes())?;
            for payload in applied.iter() {
                out.write_all(&(payload.len() as u32).to_be_bytes())?;
                out.write_all(payload)?;
            }
            Ok(())
        }

        fn restore(&self, input: &mut dyn Read) -> io::Result<()> {
            let mut count_buf = [0u8; 4];
            input.read_exact(&mut count_buf)?;
            let mut applied = VecDeque::new();
            for _ in 0..u32::from_be_bytes(count_buf) {
                let mut len_buf = [0u8; 4];
                input.read_exact(&mut len_buf)?;
                let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
                input.read_exact(&mut payload)?;
                applied.push_back(Bytes::from(payload));
            }
            *self.applied.lock().unwrap() = applied;
            Ok(())
        }

        fn reset(&self) {
            self.applied.lock().unwrap().clear();
        }
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn machine_with_master(
        dir: &Path,
        master: Arc<RecordingMaster>,
    ) -> (JournalStateMachine, Arc<JournalRegistry>, Arc<SnapshotGate>) {
        let registry = Arc::new(JournalRegistry::new());
        registry.register(master).unwrap();
        let gate = Arc::new(SnapshotGate::new(true));
        let machine = JournalStateMachine::create(
            test_logger(),
            Arc::clone(&registry),
            Arc::clone(&gate),
            dir.to_path_buf(),
        )
        .unwrap();
        (machine, registry, gate)
    }

    fn committed(sn: i64, target: &str, payload: &'static [u8]) -> Bytes {
        JournalEntry::new(SequenceNumber::new(sn), target, Bytes::from_static(payload)).encode()
    }

    #[test]
    fn replay_dispatches_in_sn_order() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), Arc::clone(&master));

        machine.apply_committed(committed(0, "files", b"a"));
        machine.apply_committed(committed(1, "files", b"b"));
        assert_eq!(machine.last_applied_sn(), 1);
        assert_eq!(
            master.applied_payloads(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn serve_mode_does_not_redispatch() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), Arc::clone(&master));

        machine.apply_committed(committed(0, "files", b"a"));
        let upgraded_at = machine.upgrade();
        assert_eq!(upgraded_at.val(), 0);

        // Pre-applied on the primary; replay would double-apply.
        machine.apply_committed(committed(1, "files", b"b"));
        assert_eq!(machine.last_applied_sn(), 1);
        assert_eq!(master.applied_payloads(), vec![Bytes::from_static(b"a")]);
    }

    #[test]
    fn sentinels_only_advance_primary_start() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), Arc::clone(&master));

        machine.apply_committed(committed(0, "files", b"a"));
        let sentinel = SequenceNumber::draw_sentinel();
        machine.apply_committed(JournalEntry::sentinel(sentinel).encode());

        assert_eq!(machine.last_primary_start_sn(), sentinel.val());
        assert_eq!(machine.last_applied_sn(), 0);
        assert_eq!(master.applied_payloads().len(), 1);
    }

    #[test]
    fn upgrade_is_idempotent_within_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), master);

        machine.apply_committed(committed(0, "files", b"a"));
        assert_eq!(machine.upgrade().val(), 0);
        assert_eq!(machine.upgrade().val(), 0);
        assert_eq!(machine.mode(), Mode::Serve);
    }

    #[test]
    fn suspend_buffers_until_resume() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), Arc::clone(&master));

        machine.suspend(Box::new(|| {})).unwrap();
        machine.apply_committed(committed(0, "files", b"a"));
        assert_eq!(master.applied_payloads().len(), 0);
        assert_eq!(machine.last_applied_sn(), -1);

        machine.resume().unwrap();
        assert_eq!(master.applied_payloads().len(), 1);
        assert_eq!(machine.last_applied_sn(), 0);
    }

    #[test]
    fn suspend_refused_while_serving() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), master);

        machine.upgrade();
        let err = machine.suspend(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, SuspendError::NotStandby));
    }

    #[test]
    fn upgrade_aborts_suspension_and_drains_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), Arc::clone(&master));

        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        machine
            .suspend(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        machine.apply_committed(committed(0, "files", b"a"));

        assert_eq!(machine.upgrade().val(), 0);
        assert!(interrupted.load(Ordering::SeqCst));
        assert_eq!(master.applied_payloads().len(), 1);
    }

    #[test]
    fn snapshot_then_restore_skips_replayed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), Arc::clone(&master));

        machine.apply_committed(committed(0, "files", b"a"));
        machine.apply_committed(committed(1, "files", b"b"));
        let snapshot_sn = machine.take_local_snapshot().unwrap();
        assert_eq!(snapshot_sn.val(), 1);

        // A fresh machine restores the snapshot, then the engine replays
        // the whole log; entries 0 and 1 must not double-apply.
        let master2 = RecordingMaster::new("files");
        let (machine2, _, _) = machine_with_master(dir.path(), Arc::clone(&master2));
        // reset_all wiped it; restore came from the snapshot.
        assert_eq!(machine2.last_applied_sn(), 1);
        machine2.apply_committed(committed(0, "files", b"a"));
        machine2.apply_committed(committed(1, "files", b"b"));
        machine2.apply_committed(committed(2, "files", b"c"));
        assert_eq!(machine2.last_applied_sn(), 2);
        assert_eq!(master2.applied_payloads().len(), 3);
    }

    #[test]
    fn snapshot_refused_when_gate_disallows() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, gate) = machine_with_master(dir.path(), master);

        gate.set_allowed(false);
        assert!(matches!(
            machine.take_local_snapshot(),
            Err(SnapshotError::Refused(_))
        ));
    }

    #[test]
    fn install_snapshot_refused_while_serving() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), master);

        machine.upgrade();
        let mut empty: &[u8] = &0u32.to_be_bytes();
        let err = machine
            .install_snapshot(&mut empty, SequenceNumber::new(10))
            .unwrap_err();
        assert!(matches!(err, InstallSnapshotError::NotInReplay));
    }

    #[tokio::test]
    async fn catchup_completes_when_target_reached() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), Arc::clone(&master));
        let machine = Arc::new(machine);

        // Already-reached target completes immediately.
        machine.apply_committed(committed(0, "files", b"a"));
        let done = machine.catchup(SequenceNumber::new(0));
        assert!(done.is_complete());
        done.wait().await.unwrap();

        let pending = machine.catchup(SequenceNumber::new(2));
        assert!(!pending.is_complete());
        let waiter = tokio::spawn(pending.wait());
        machine.apply_committed(committed(1, "files", b"b"));
        machine.apply_committed(committed(2, "files", b"c"));
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn closing_mode_drops_entries() {
        let dir = tempfile::tempdir().unwrap();
        let master = RecordingMaster::new("files");
        let (machine, _, _) = machine_with_master(dir.path(), Arc::clone(&master));

        machine.set_closing();
        machine.apply_committed(committed(0, "files", b"a"));
        assert_eq!(master.applied_payloads().len(), 0);
        assert_eq!(machine.last_applied_sn(), -1);
    }
}
