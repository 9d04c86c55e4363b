use crate::journal::SequenceNumber;
use crate::writer::{AppendError, RaftJournalWriter};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// The shared slot RPC-side `Journal` handles read the current writer
/// from. Holds the writer while this peer is primary; empty on standbys.
pub type WriterSlot = Arc<std::sync::RwLock<Option<Arc<AsyncJournalWriter>>>>;

#[derive(Debug)]
enum Event {
    Append {
        target: String,
        payload: Bytes,
        callback: Callback<SequenceNumber, AppendError>,
    },
    Shutdown,
}

struct Callback<O, E>(oneshot::Sender<Result<O, E>>);

impl<O, E> Callback<O, E> {
    fn send(self, message: Result<O, E>) {
        // Receiver gone means the caller gave up waiting; nothing to do.
        let _ = self.0.send(message);
    }
}

impl<O, E> std::fmt::Debug for Callback<O, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback").finish()
    }
}

/// AsyncJournalWriter fronts the RaftJournalWriter for concurrent RPC
/// handlers: requests queue on a bounded channel and a single flush task
/// submits them, so callers see their own appends land in submission
/// order. Commit completion is awaited off the flush path, which keeps the
/// queue moving while earlier entries are still replicating.
pub struct AsyncJournalWriter {
    logger: slog::Logger,
    sender: mpsc::Sender<Event>,
    writer: Arc<RaftJournalWriter>,
    closed: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncJournalWriter {
    pub fn spawn(
        logger: slog::Logger,
        writer: Arc<RaftJournalWriter>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let flush_task = tokio::spawn(Self::run_flush_loop(
            logger.clone(),
            receiver,
            Arc::clone(&writer),
        ));
        Arc::new(AsyncJournalWriter {
            logger,
            sender,
            writer,
            closed: AtomicBool::new(false),
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    /// Enqueues an append and waits for its commit. Fails with
    /// `NotPrimary` once the writer is closed.
    pub async fn append(&self, target: &str, payload: Bytes) -> Result<SequenceNumber, AppendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppendError::NotPrimary);
        }
        let (tx, rx) = oneshot::channel();
        let event = Event::Append {
            target: target.to_string(),
            payload,
            callback: Callback(tx),
        };
        self.sender
            .send(event)
            .await
            .map_err(|_| AppendError::NotPrimary)?;
        rx.await.map_err(|_| AppendError::NotPrimary)?
    }

    /// Flushes everything already queued, then closes the underlying
    /// writer (which drains outstanding commits). Appends arriving after
    /// this fail with a not-primary error.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Shutdown marks the queue tail; the flush loop processes
        // everything ahead of it.
        if self.sender.send(Event::Shutdown).await.is_err() {
            slog::warn!(self.logger, "Flush task exited before shutdown event");
        }
        let flush_task = self
            .flush_task
            .lock()
            .expect("async journal writer task slot poisoned")
            .take();
        if let Some(task) = flush_task {
            if let Err(e) = task.await {
                slog::warn!(self.logger, "Flush task failed during close"; "error" => %e);
            }
        }
        self.writer.close().await;
        slog::info!(self.logger, "Async journal writer closed");
    }

    async fn run_flush_loop(
        logger: slog::Logger,
        mut receiver: mpsc::Receiver<Event>,
        writer: Arc<RaftJournalWriter>,
    ) {
        while let Some(event) = receiver.recv().await {
            match event {
                Event::Append {
                    target,
                    payload,
                    callback,
                } => {
                    // The submission await is ordered (one flush task);
                    // only the commit wait is pushed onto its own task.
                    match writer.append(&target, payload).await {
                        Ok(pending) => {
                            tokio::spawn(async move {
                                callback.send(pending.wait_committed().await);
                            });
                        }
                        Err(e) => callback.send(Err(e)),
                    }
                }
                Event::Shutdown => break,
            }
        }
        slog::debug!(logger, "Flush loop exited");
    }
}
