//! Shield State Store
//!
//! Per-domain shield overrides, keyed by normalized domain.
//!
//! - `ShieldStateStore`: the storage contract
//! - `MemoryStateStore`: in-process map, used for tests and private sessions
//! - `JsonFileStateStore`: `{domain: {key: bool}}` JSON file, rewritten
//!   atomically (temp file + rename) on every change
//! - `ShieldStateService`: the single write path. Serves reads from memory
//!   and hands persistence to a background writer thread, so the request
//!   path never waits on disk.

use crate::domain::normalize_host;
use crate::policy::{Shield, ShieldState};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from a state store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("State writer has stopped")]
    WriterClosed,
}

/// Persisted per-domain shield state
pub trait ShieldStateStore: Send + Sync {
    fn read(&self, domain: &str) -> Result<Option<ShieldState>, StoreError>;

    fn write(&self, domain: &str, state: ShieldState) -> Result<(), StoreError>;

    fn delete(&self, domain: &str) -> Result<(), StoreError>;

    /// Remove every domain ("clear private data")
    fn delete_all(&self) -> Result<(), StoreError>;

    fn all(&self) -> Result<BTreeMap<String, ShieldState>, StoreError>;
}

/// Store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<BTreeMap<String, ShieldState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShieldStateStore for MemoryStateStore {
    fn read(&self, domain: &str) -> Result<Option<ShieldState>, StoreError> {
        Ok(self.states.read().get(domain).copied())
    }

    fn write(&self, domain: &str, state: ShieldState) -> Result<(), StoreError> {
        self.states.write().insert(domain.to_string(), state);
        Ok(())
    }

    fn delete(&self, domain: &str) -> Result<(), StoreError> {
        self.states.write().remove(domain);
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.states.write().clear();
        Ok(())
    }

    fn all(&self) -> Result<BTreeMap<String, ShieldState>, StoreError> {
        Ok(self.states.read().clone())
    }
}

/// JSON file store
pub struct JsonFileStateStore {
    path: PathBuf,
    states: Mutex<BTreeMap<String, ShieldState>>,
}

impl JsonFileStateStore {
    /// Open (or start) the state file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let states = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => {
                let raw: BTreeMap<String, BTreeMap<String, bool>> = serde_json::from_str(&content)?;
                raw.iter()
                    .map(|(domain, keys)| (domain.clone(), ShieldState::from_map(keys)))
                    .filter(|(_, state)| !state.is_default())
                    .collect()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Opened shield state file {:?}: {} domains", path, states.len());

        Ok(Self {
            path,
            states: Mutex::new(states),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, states: &BTreeMap<String, ShieldState>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let raw: BTreeMap<&str, BTreeMap<String, bool>> = states
            .iter()
            .map(|(domain, state)| (domain.as_str(), state.to_map()))
            .collect();

        // Write to temp file first, then rename over the old one
        let temp_path = self.path.with_extension("tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &raw)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;
        debug!("Saved {} domains to {:?}", states.len(), self.path);
        Ok(())
    }
}

impl ShieldStateStore for JsonFileStateStore {
    fn read(&self, domain: &str) -> Result<Option<ShieldState>, StoreError> {
        Ok(self.states.lock().get(domain).copied())
    }

    fn write(&self, domain: &str, state: ShieldState) -> Result<(), StoreError> {
        let mut states = self.states.lock();
        states.insert(domain.to_string(), state);
        self.save(&states)
    }

    fn delete(&self, domain: &str) -> Result<(), StoreError> {
        let mut states = self.states.lock();
        if states.remove(domain).is_some() {
            self.save(&states)?;
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        let mut states = self.states.lock();
        states.clear();
        self.save(&states)
    }

    fn all(&self) -> Result<BTreeMap<String, ShieldState>, StoreError> {
        Ok(self.states.lock().clone())
    }
}

/// Work for the writer thread
enum PersistOp {
    Write(String, ShieldState),
    Delete(String),
    DeleteAll,
    Flush(Sender<()>),
}

/// Synchronized front of a backing store
pub struct ShieldStateService {
    states: RwLock<BTreeMap<String, ShieldState>>,
    backing: Arc<dyn ShieldStateStore>,
    private: AtomicBool,
    writer_tx: Option<Sender<PersistOp>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl ShieldStateService {
    /// Load everything from `backing` and start the writer thread
    pub fn new(backing: Arc<dyn ShieldStateStore>) -> Result<Self, StoreError> {
        let states = match backing.all() {
            Ok(states) => states,
            Err(e) => {
                warn!("Could not load shield state, starting empty: {}", e);
                BTreeMap::new()
            }
        };

        let (tx, rx) = unbounded();
        let writer_store = Arc::clone(&backing);
        let writer = thread::Builder::new()
            .name("shield-state-writer".to_string())
            .spawn(move || {
                debug!("Shield state writer started");
                run_writer_loop(writer_store, rx);
                debug!("Shield state writer stopped");
            })?;

        Ok(Self {
            states: RwLock::new(states),
            backing,
            private: AtomicBool::new(false),
            writer_tx: Some(tx),
            writer: Some(writer),
        })
    }

    /// Service over a memory-only store
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::new(Arc::new(MemoryStateStore::new()))
    }

    /// Set or clear one shield for a domain, returning the new state
    pub fn set_shield(&self, domain: &str, shield: Shield, value: Option<bool>) -> ShieldState {
        self.update(domain, |state| state.set(shield, value))
    }

    /// Toggle the all-shields-off escape hatch for a domain
    pub fn set_all_off(&self, domain: &str, all_off: bool) -> ShieldState {
        self.update(domain, |state| state.all_off = all_off)
    }

    /// Current state of a domain, default if never set
    pub fn get(&self, domain: &str) -> ShieldState {
        self.states
            .read()
            .get(&normalize_host(domain))
            .copied()
            .unwrap_or_default()
    }

    fn update(&self, domain: &str, change: impl FnOnce(&mut ShieldState)) -> ShieldState {
        let domain = normalize_host(domain);
        let mut states = self.states.write();
        let mut state = states.get(&domain).copied().unwrap_or_default();
        change(&mut state);
        self.apply(&mut states, domain, state);
        state
    }

    fn apply(&self, states: &mut BTreeMap<String, ShieldState>, domain: String, state: ShieldState) {
        // Back to defaults: nothing worth keeping
        let op = if state.is_default() {
            states.remove(&domain);
            PersistOp::Delete(domain.clone())
        } else {
            states.insert(domain.clone(), state);
            PersistOp::Write(domain.clone(), state)
        };

        info!("Shield state for '{}': {:?}", domain, state.to_map());

        if !self.is_private() {
            self.persist(op);
        }
    }

    /// Wipe every domain, in memory and on disk
    pub fn clear_all(&self) {
        self.states.write().clear();
        self.persist(PersistOp::DeleteAll);
        info!("Cleared all shield state");
    }

    /// Private browsing keeps changes in memory only. Leaving it restores
    /// what was persisted.
    pub fn set_private(&self, private: bool) {
        let was_private = self.private.swap(private, Ordering::SeqCst);
        if was_private && !private {
            self.flush();
            match self.backing.all() {
                Ok(states) => *self.states.write() = states,
                Err(e) => warn!("Could not reload shield state after private browsing: {}", e),
            }
        }
    }

    pub fn is_private(&self) -> bool {
        self.private.load(Ordering::SeqCst)
    }

    /// Block until every queued write has reached the backing store
    pub fn flush(&self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.send(PersistOp::Flush(tx)) {
            let _ = rx.recv();
        }
    }

    fn persist(&self, op: PersistOp) {
        if !self.send(op) {
            warn!("{}", StoreError::WriterClosed);
        }
    }

    fn send(&self, op: PersistOp) -> bool {
        self.writer_tx
            .as_ref()
            .is_some_and(|tx| tx.send(op).is_ok())
    }
}

impl ShieldStateStore for ShieldStateService {
    fn read(&self, domain: &str) -> Result<Option<ShieldState>, StoreError> {
        Ok(self.states.read().get(domain).copied())
    }

    fn write(&self, domain: &str, state: ShieldState) -> Result<(), StoreError> {
        let mut states = self.states.write();
        self.apply(&mut states, normalize_host(domain), state);
        Ok(())
    }

    fn delete(&self, domain: &str) -> Result<(), StoreError> {
        self.write(domain, ShieldState::default())
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.clear_all();
        Ok(())
    }

    fn all(&self) -> Result<BTreeMap<String, ShieldState>, StoreError> {
        Ok(self.states.read().clone())
    }
}

impl Drop for ShieldStateService {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop after it drains
        self.writer_tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

fn run_writer_loop(store: Arc<dyn ShieldStateStore>, rx: Receiver<PersistOp>) {
    for op in rx.iter() {
        let result = match op {
            PersistOp::Write(domain, state) => store.write(&domain, state),
            PersistOp::Delete(domain) => store.delete(&domain),
            PersistOp::DeleteAll => store.delete_all(),
            PersistOp::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Failed to persist shield state: {}", e);
        }
    }
}
