//! Guest-visible liveness keys.
//!
//! The orchestration layer outside the guest watches a handful of
//! key/value pairs to learn when the agent and its sessions are up. This
//! module only writes those keys; how they reach the host is up to the
//! [`KeyValueStore`] behind it.
//!
//! Key layout:
//!
//! ```text
//! {prefix}|{component}.started          unix timestamp
//! {prefix}.sessions|{id}.started        unix timestamp
//! {prefix}.sessions|{id}.status         pending | running | detached | exited
//! {prefix}.sessions|{id}.exit_code      integer, written on exit
//! {prefix}.networks|client.assigned.IP  address handed to the host side
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::session::SessionStatus;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "guestinfo.vice..init";

/// Errors from a key/value store.
#[derive(Error, Debug)]
pub enum LivenessError {
    /// I/O error on the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file is not a valid key map.
    #[error("invalid store contents: {0}")]
    Format(#[from] serde_json::Error),
}

/// A guest-visible key/value store.
pub trait KeyValueStore: Send + Sync {
    /// Sets `key` to `value`.
    fn set(&self, key: &str, value: &str) -> Result<(), LivenessError>;

    /// Reads `key`.
    fn get(&self, key: &str) -> Result<Option<String>, LivenessError>;
}

/// In-memory store, used by tests and when no store is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently set, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl KeyValueStore for MemoryStore {
    fn set(&self, key: &str, value: &str) -> Result<(), LivenessError> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, LivenessError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }
}

/// A JSON object on disk, rewritten through a temporary file on every set.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Uses the file at `path`, creating it on the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, LivenessError> {
        match std::fs::read(&self.path) {
            Ok(contents) if contents.is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_slice(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyValueStore for FileStore {
    fn set(&self, key: &str, value: &str) -> Result<(), LivenessError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&values)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, LivenessError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_all()?.get(key).cloned())
    }
}

/// Writes liveness keys under a prefix.
///
/// Write failures are logged and otherwise ignored: liveness reporting
/// never interrupts attach service.
#[derive(Clone)]
pub struct Liveness {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl Liveness {
    /// Creates a writer over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Key announcing that `component` started.
    pub fn component_key(&self, component: &str) -> String {
        format!("{}|{}.started", self.prefix, component)
    }

    /// Key for a session attribute (`started`, `status`, `exit_code`).
    pub fn session_key(&self, session_id: &str, field: &str) -> String {
        format!("{}.sessions|{}.{}", self.prefix, session_id, field)
    }

    /// Key carrying the address assigned to the host-side client.
    pub fn client_address_key(&self) -> String {
        format!("{}.networks|client.assigned.IP", self.prefix)
    }

    /// Marks `component` as started.
    pub fn component_started(&self, component: &str) {
        self.write(&self.component_key(component), &unix_now().to_string());
    }

    /// Records a session's process start.
    pub fn session_started(&self, session_id: &str) {
        self.write(&self.session_key(session_id, "started"), &unix_now().to_string());
        self.session_status(session_id, SessionStatus::Running);
    }

    /// Records a session status.
    pub fn session_status(&self, session_id: &str, status: SessionStatus) {
        self.write(&self.session_key(session_id, "status"), status.as_str());
    }

    /// Records a session's exit.
    pub fn session_exited(&self, session_id: &str, exit_code: Option<i32>) {
        self.session_status(session_id, SessionStatus::Exited);
        let code = exit_code.map(|c| c.to_string()).unwrap_or_default();
        self.write(&self.session_key(session_id, "exit_code"), &code);
    }

    /// Publishes the host-side client address.
    pub fn client_address(&self, address: &str) {
        self.write(&self.client_address_key(), address);
    }

    fn write(&self, key: &str, value: &str) {
        match self.store.set(key, value) {
            Ok(()) => tracing::debug!(key = %key, value = %value, "Liveness key updated"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to update liveness key"),
        }
    }
}

impl std::fmt::Debug for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Liveness")
            .field("prefix", &self.prefix)
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
