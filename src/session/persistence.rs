// ABOUTME: Terminal registry snapshots that survive daemon restarts
// Saves the registry as a single JSON array, written atomically via temp file + rename

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::models::TerminalRecord;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to access snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Snapshot store rejected write: {0}")]
    Rejected(String),
}

/// Where registry snapshots are kept. Implementations are called from the
/// blocking pool, never while the registry lock is held.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Vec<TerminalRecord>, PersistenceError>;
    fn save(&self, records: &[TerminalRecord]) -> Result<(), PersistenceError>;
}

/// Snapshot kept as a JSON array in one file.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Vec<TerminalRecord>, PersistenceError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|source| PersistenceError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, records: &[TerminalRecord]) -> Result<(), PersistenceError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;

        let json = serde_json::to_vec_pretty(records)?;

        // Write next to the target so the rename stays on one filesystem
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        tmp.write_all(&json).map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;

        debug!("Saved {} terminal(s) to {}", records.len(), self.path.display());
        Ok(())
    }
}

/// Snapshot store that keeps the last snapshot in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    records: Mutex<Vec<TerminalRecord>>,
    saves: AtomicUsize,
    reject_writes: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from records as if loaded from disk.
    pub fn with_records(records: Vec<TerminalRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    /// The last saved snapshot.
    pub fn records(&self) -> Vec<TerminalRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every subsequent save fail, like a full or read-only disk.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Vec<TerminalRecord>, PersistenceError> {
        Ok(self.records())
    }

    fn save(&self, records: &[TerminalRecord]) -> Result<(), PersistenceError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Rejected("writes disabled".to_string()));
        }
        *self.records.lock().unwrap_or_else(PoisonError::into_inner) = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
