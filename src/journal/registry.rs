use crate::journal::SequenceNumber;
use crate::writer::{AppendError, WriterSlot};
use bytes::Bytes;
use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::sync::{Arc, RwLock};

/// Master is the callback surface a master subsystem implements to own a
/// logical journal. State mutation happens inside the master; this crate
/// only routes committed payloads and checkpoint streams to it.
pub trait Master: Send + Sync {
    /// The logical journal name. Must be unique within a journal system.
    fn name(&self) -> &str;

    /// Applies one committed payload. Called in SN order from the engine's
    /// single apply task. An error here means the master's state no longer
    /// matches the log; the caller treats it as fatal.
    fn apply(&self, payload: Bytes) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Streams a consistent checkpoint of the master's current state.
    fn checkpoint(&self, out: &mut dyn io::Write) -> io::Result<()>;

    /// Replaces the master's state from a checkpoint stream.
    fn restore(&self, input: &mut dyn io::Read) -> io::Result<()>;

    /// Discards all in-memory state, returning the master to its
    /// just-constructed condition.
    fn reset(&self);
}

/// JournalRegistry maps logical-journal names to their masters. It is the
/// multiplexer key: the state machine uses it to fan committed entries out,
/// and snapshots iterate it to capture every master.
pub struct JournalRegistry {
    masters: RwLock<HashMap<String, Arc<dyn Master>>>,
}

impl JournalRegistry {
    pub fn new() -> Self {
        JournalRegistry {
            masters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, master: Arc<dyn Master>) -> Result<(), RegistryError> {
        let name = master.name().to_string();
        let mut masters = self.masters.write().expect("journal registry lock poisoned");
        if masters.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        masters.insert(name, master);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Master>> {
        self.masters
            .read()
            .expect("journal registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .masters
            .read()
            .expect("journal registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// All masters, sorted by name so snapshot layout is deterministic.
    pub fn masters(&self) -> Vec<Arc<dyn Master>> {
        let masters = self.masters.read().expect("journal registry lock poisoned");
        let mut all: Vec<Arc<dyn Master>> = masters.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn reset_all(&self) {
        for master in self.masters().iter() {
            master.reset();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a journal named '{0}' is already registered")]
    DuplicateName(String),
}

/// Journal is the append handle a master holds. All handles created by one
/// journal system share the writer slot: the slot holds the current
/// AsyncJournalWriter while this peer is primary and is empty on standbys.
pub struct Journal {
    name: String,
    writer: WriterSlot,
}

impl Journal {
    pub(crate) fn new(name: String, writer: WriterSlot) -> Self {
        Journal { name, writer }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a payload to this logical journal. Resolves once the entry
    /// is committed by the quorum. Fails with `AppendError::NotPrimary` on
    /// a standby.
    pub async fn append(&self, payload: Bytes) -> Result<SequenceNumber, AppendError> {
        // Clone the Arc out so the guard is not held across the await.
        let writer = self
            .writer
            .read()
            .expect("journal writer slot lock poisoned")
            .clone();
        match writer {
            Some(writer) => writer.append(&self.name, payload).await,
            None => Err(AppendError::NotPrimary),
        }
    }
}
