use bytes::Bytes;
use raft_journal::Master;
use slog::Drain;
use std::collections::BTreeMap;
use std::error::Error;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// A master owning a key-value store. Payloads are `key=value` strings;
/// checkpoints carry the whole map.
pub struct KvMaster {
    name: String,
    state: Mutex<BTreeMap<String, String>>,
    // apply() calls only; restore does not count. Lets tests verify how
    // many entries actually replayed from the log tail.
    applied_from_log: AtomicUsize,
}

impl KvMaster {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(KvMaster {
            name: name.to_string(),
            state: Mutex::new(BTreeMap::new()),
            applied_from_log: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn applied_from_log(&self) -> usize {
        self.applied_from_log.load(Ordering::SeqCst)
    }
}

impl Master for KvMaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, payload: Bytes) -> Result<(), Box<dyn Error + Send + Sync>> {
        let text = std::str::from_utf8(&payload)?;
        let (key, value) = text
            .split_once('=')
            .ok_or_else(|| format!("malformed kv payload: {}", text))?;
        self.state
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.applied_from_log.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn checkpoint(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let state = self.state.lock().unwrap();
        out.write_all(&(state.len() as u32).to_be_bytes())?;
        for (key, value) in state.iter() {
            for part in [key, value] {
                out.write_all(&(part.len() as u32).to_be_bytes())?;
                out.write_all(part.as_bytes())?;
            }
        }
        Ok(())
    }

    fn restore(&self, input: &mut dyn Read) -> std::io::Result<()> {
        let mut count_buf = [0u8; 4];
        input.read_exact(&mut count_buf)?;
        let mut state = BTreeMap::new();
        for _ in 0..u32::from_be_bytes(count_buf) {
            let mut pair = Vec::with_capacity(2);
            for _ in 0..2 {
                let mut len_buf = [0u8; 4];
                input.read_exact(&mut len_buf)?;
                let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
                input.read_exact(&mut buf)?;
                pair.push(String::from_utf8(buf).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                })?);
            }
            let value = pair.pop().unwrap();
            let key = pair.pop().unwrap();
            state.insert(key, value);
        }
        *self.state.lock().unwrap() = state;
        Ok(())
    }

    fn reset(&self) {
        self.state.lock().unwrap().clear();
    }
}
