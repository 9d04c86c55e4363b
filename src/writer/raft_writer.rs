use crate::engine::{CommitFuture, EngineError, RaftEngine};
use crate::journal::{JournalEntry, SequenceNumber};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// RaftJournalWriter appends journal entries on the primary.
///
/// There is at most one per process, created when primacy is gained with
/// `next_sn` picked from the upgraded state machine, and closed (never
/// reused) when primacy is lost. SN assignment is strictly serial and
/// matches engine log order; commits may complete out of order.
pub struct RaftJournalWriter {
    logger: slog::Logger,
    engine: Arc<dyn RaftEngine>,
    call_ids: Arc<AtomicU64>,
    next_sn: Mutex<i64>,
    max_entry_bytes: usize,
    inflight_limit_bytes: usize,
    // Byte-weighted permits: appends beyond the in-flight bound block their
    // caller until a prior commit completes.
    inflight: Arc<Semaphore>,
    pending: Arc<PendingCommits>,
    closed: AtomicBool,
}

impl RaftJournalWriter {
    pub fn new(
        logger: slog::Logger,
        engine: Arc<dyn RaftEngine>,
        call_ids: Arc<AtomicU64>,
        next_sn: SequenceNumber,
        max_entry_bytes: usize,
        inflight_limit_bytes: usize,
    ) -> Self {
        RaftJournalWriter {
            logger,
            engine,
            call_ids,
            next_sn: Mutex::new(next_sn.val()),
            max_entry_bytes,
            inflight_limit_bytes,
            inflight: Arc::new(Semaphore::new(inflight_limit_bytes)),
            pending: Arc::new(PendingCommits::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn next_sn(&self) -> SequenceNumber {
        SequenceNumber::new(*self.next_sn.lock().expect("journal writer cursor poisoned"))
    }

    /// Assigns the next SN and submits the entry to the engine. The first
    /// await is backpressure only; once this returns, the entry holds its
    /// place in the log. Await the returned handle for commit.
    pub async fn append(&self, target: &str, payload: Bytes) -> Result<PendingAppend, AppendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppendError::NotPrimary);
        }
        let size = 8 + 2 + target.len() + payload.len();
        if size > self.max_entry_bytes {
            return Err(AppendError::EntryTooLarge {
                size,
                max: self.max_entry_bytes,
            });
        }

        let permit = Arc::clone(&self.inflight)
            .acquire_many_owned(size.min(self.inflight_limit_bytes) as u32)
            .await
            .map_err(|_| AppendError::NotPrimary)?;
        // Re-check: we may have been parked at the semaphore across a
        // close().
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppendError::NotPrimary);
        }

        let (sn, commit) = {
            let mut next_sn = self.next_sn.lock().expect("journal writer cursor poisoned");
            let sn = SequenceNumber::new(*next_sn);
            let entry = JournalEntry::new(sn, target, payload);
            let call_id = self.call_ids.fetch_add(1, Ordering::SeqCst);
            // Submit while holding the cursor so log order == SN order.
            let commit = self.engine.submit(call_id, entry.encode())?;
            *next_sn += 1;
            (sn, commit)
        };

        Ok(PendingAppend {
            sn,
            commit,
            _permit: permit,
            _pending: PendingGuard::register(Arc::clone(&self.pending)),
        })
    }

    /// Refuses new appends, then waits for every in-flight commit to
    /// resolve. Callers parked at the backpressure bound are failed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inflight.close();
        slog::info!(
            self.logger,
            "Closing journal writer";
            "pending_commits" => self.pending.count()
        );
        self.pending.drained().await;
    }
}

/// An accepted append: the entry occupies `sn` in the log, commit still
/// outstanding.
#[derive(Debug)]
pub struct PendingAppend {
    sn: SequenceNumber,
    commit: CommitFuture,
    _permit: OwnedSemaphorePermit,
    _pending: PendingGuard,
}

impl PendingAppend {
    pub fn sn(&self) -> SequenceNumber {
        self.sn
    }

    pub async fn wait_committed(self) -> Result<SequenceNumber, AppendError> {
        match self.commit.wait_committed().await {
            Ok(_reply) => Ok(self.sn),
            Err(e) => Err(AppendError::Engine(e)),
        }
    }
}

#[derive(Debug)]
struct PendingCommits {
    count: AtomicUsize,
    drained: Notify,
}

impl PendingCommits {
    fn new() -> Self {
        PendingCommits {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Drop-based so a pending commit is accounted for even if its caller
/// abandons the future.
#[derive(Debug)]
struct PendingGuard {
    pending: Arc<PendingCommits>,
}

impl PendingGuard {
    fn register(pending: Arc<PendingCommits>) -> Self {
        pending.count.fetch_add(1, Ordering::SeqCst);
        PendingGuard { pending }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.pending.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pending.drained.notify_waiters();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    // Either this peer never was primary, or the writer was torn down by
    // losePrimacy while the append was in flight.
    #[error("not primary; journal writes are not accepted here")]
    NotPrimary,

    #[error("journal entry too large ({size} bytes, max {max})")]
    EntryTooLarge { size: usize, max: usize },

    #[error("engine failed to replicate entry")]
    Engine(#[from] EngineError),
}
