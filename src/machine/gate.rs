use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// SnapshotGate decides whether the state machine may snapshot right now.
///
/// Applies (and any other state mutation) hold the read side for the
/// duration of the mutation; a snapshot holds the write side, so it waits
/// for in-flight mutations to drain and blocks new ones while it runs. The
/// `allowed` bit is policy on top of that: false while the primary is
/// serving writes and while the machine is suspended for external catch-up,
/// true on a standby in replay.
pub struct SnapshotGate {
    allowed: AtomicBool,
    lock: RwLock<()>,
}

impl SnapshotGate {
    pub fn new(allowed: bool) -> Self {
        SnapshotGate {
            allowed: AtomicBool::new(allowed),
            lock: RwLock::new(()),
        }
    }

    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }

    /// Taken by every apply. Many applies may hold this concurrently.
    pub fn mutation_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().expect("snapshot gate lock poisoned")
    }

    /// Taken by a snapshot. Blocks until all mutations drain, then checks
    /// the policy bit (checking after acquisition, so a snapshot that raced
    /// a `set_allowed(false)` is refused rather than run).
    pub fn snapshot_guard(&self) -> Result<RwLockWriteGuard<'_, ()>, SnapshotRefused> {
        if !self.is_allowed() {
            return Err(SnapshotRefused);
        }
        let guard = self.lock.write().expect("snapshot gate lock poisoned");
        if !self.is_allowed() {
            return Err(SnapshotRefused);
        }
        Ok(guard)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("snapshots are not allowed right now")]
pub struct SnapshotRefused;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn snapshot_refused_when_not_allowed() {
        let gate = SnapshotGate::new(false);
        assert!(gate.snapshot_guard().is_err());
        gate.set_allowed(true);
        assert!(gate.snapshot_guard().is_ok());
    }

    #[test]
    fn snapshot_waits_for_mutations_to_drain() {
        let gate = Arc::new(SnapshotGate::new(true));

        let mutation = gate.mutation_guard();
        let gate2 = Arc::clone(&gate);
        let snapshotter = std::thread::spawn(move || {
            let _guard = gate2.snapshot_guard().unwrap();
        });

        // The snapshotter must be stuck behind the mutation guard.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!snapshotter.is_finished());

        drop(mutation);
        snapshotter.join().unwrap();
    }

    #[test]
    fn disallow_after_waiting_refuses_snapshot() {
        let gate = Arc::new(SnapshotGate::new(true));
        let mutation = gate.mutation_guard();

        let gate2 = Arc::clone(&gate);
        let snapshotter = std::thread::spawn(move || gate2.snapshot_guard().map(|_| ()));

        std::thread::sleep(Duration::from_millis(50));
        gate.set_allowed(false);
        drop(mutation);

        assert!(snapshotter.join().unwrap().is_err());
    }
}
