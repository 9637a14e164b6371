// ABOUTME: In-memory registry of daemon-managed terminals, shared by every client connection
// Mutations are linearized under one lock; snapshots are persisted after the lock is released

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{ConfigId, HealthState, TerminalId, TerminalRecord};
use crate::session::persistence::{PersistenceError, SnapshotStore};

/// Why the registry refused a change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Terminal already exists: {0}")]
    AlreadyExists(TerminalId),
    #[error("Terminal {0} is already being created by another request")]
    CreationInProgress(TerminalId),
    #[error("Config {config_id} is already bound to terminal {id}")]
    ConfigInUse { config_id: ConfigId, id: TerminalId },
    #[error("Backing session {name} is already claimed by terminal {id}")]
    BackingNameInUse { name: String, id: TerminalId },
    #[error("Terminal not found: {0}")]
    NotFound(TerminalId),
}

#[derive(Debug, Clone)]
struct Reservation {
    config_id: ConfigId,
    backing_session_name: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    records: BTreeMap<TerminalId, TerminalRecord>,
    /// Ids whose backend session is being created outside the lock
    pending: HashMap<TerminalId, Reservation>,
    generation: u64,
}

struct Snapshot {
    generation: u64,
    records: Vec<TerminalRecord>,
}

impl RegistryState {
    fn bump(&mut self) -> Snapshot {
        self.generation += 1;
        self.snapshot()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            generation: self.generation,
            records: self.records.values().cloned().collect(),
        }
    }

    fn check_available(
        &self,
        id: &str,
        config_id: &str,
        backing_session_name: &str,
    ) -> Result<(), RegistryError> {
        if self.records.contains_key(id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }
        if self.pending.contains_key(id) {
            return Err(RegistryError::CreationInProgress(id.to_string()));
        }

        let claimed = self
            .records
            .values()
            .map(|r| (r.id.as_str(), r.config_id.as_str(), r.backing_session_name.as_str()))
            .chain(self.pending.iter().map(|(pid, r)| {
                (pid.as_str(), r.config_id.as_str(), r.backing_session_name.as_str())
            }));

        for (other_id, other_config, other_backing) in claimed {
            if other_config == config_id {
                return Err(RegistryError::ConfigInUse {
                    config_id: config_id.to_string(),
                    id: other_id.to_string(),
                });
            }
            if other_backing == backing_session_name {
                return Err(RegistryError::BackingNameInUse {
                    name: backing_session_name.to_string(),
                    id: other_id.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// All known terminals. Every mutation is linearized by one lock.
pub struct TerminalRegistry {
    state: Mutex<RegistryState>,
    store: Option<Arc<dyn SnapshotStore>>,
    /// Generation of the newest snapshot written; serializes writers
    persisted: Mutex<u64>,
}

impl TerminalRegistry {
    /// A registry that never touches disk.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            store: None,
            persisted: Mutex::new(0),
        }
    }

    /// Empty registry that writes through `store`.
    pub fn with_store(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    /// Seed a registry from the store's last snapshot. A snapshot that cannot
    /// be read is logged and the registry starts empty.
    ///
    /// Seeded records are not trusted until the health reconciler has checked
    /// them against the backend.
    pub async fn load(store: Arc<dyn SnapshotStore>) -> Self {
        let loader = Arc::clone(&store);
        let loaded = match tokio::task::spawn_blocking(move || loader.load()).await {
            Ok(result) => result,
            Err(e) => Err(PersistenceError::Rejected(format!("snapshot load task failed: {}", e))),
        };

        let registry = Self::with_store(store);
        match loaded {
            Ok(records) => {
                info!("Seeded registry with {} terminal(s) from snapshot", records.len());
                let mut state = registry.state.lock().await;
                for record in records {
                    state.records.insert(record.id.clone(), record);
                }
            }
            Err(e) => warn!("Starting with an empty registry: {}", e),
        }
        registry
    }

    /// Claim `id` for a create that is about to call the backend.
    pub async fn reserve(
        &self,
        id: &str,
        config_id: &str,
        backing_session_name: &str,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        state.check_available(id, config_id, backing_session_name)?;
        state.pending.insert(
            id.to_string(),
            Reservation {
                config_id: config_id.to_string(),
                backing_session_name: backing_session_name.to_string(),
            },
        );
        debug!("Reserved terminal {}", id);
        Ok(())
    }

    /// Give up a reservation after the backend call failed.
    pub async fn release(&self, id: &str) {
        if self.state.lock().await.pending.remove(id).is_some() {
            debug!("Released reservation for terminal {}", id);
        }
    }

    /// Commit a record once the backend has confirmed its session. Consumes
    /// the matching reservation if there is one.
    pub async fn register(&self, record: TerminalRecord) -> Result<(), RegistryError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let reservation = state.pending.remove(&record.id);
            if let Err(e) = state.check_available(
                &record.id,
                &record.config_id,
                &record.backing_session_name,
            ) {
                if let Some(reservation) = reservation {
                    state.pending.insert(record.id.clone(), reservation);
                }
                return Err(e);
            }
            info!("Registered terminal {} ({})", record.id, record.backing_session_name);
            state.records.insert(record.id.clone(), record);
            state.bump()
        };
        self.persist(snapshot).await;
        Ok(())
    }

    pub async fn lookup(&self, id: &str) -> Option<TerminalRecord> {
        self.state.lock().await.records.get(id).cloned()
    }

    pub async fn lookup_by_config_id(&self, config_id: &str) -> Option<TerminalRecord> {
        self.state
            .lock()
            .await
            .records
            .values()
            .find(|r| r.config_id == config_id)
            .cloned()
    }

    /// Remove a record. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: &str) -> Option<TerminalRecord> {
        let (removed, snapshot) = {
            let mut state = self.state.lock().await;
            match state.records.remove(id) {
                Some(record) => (Some(record), Some(state.bump())),
                None => (None, None),
            }
        };
        if let Some(snapshot) = snapshot {
            info!("Removed terminal {}", id);
            self.persist(snapshot).await;
        }
        removed
    }

    /// Every record, ordered by id.
    pub async fn list(&self) -> Vec<TerminalRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Record input/output activity. Left for the next `flush` rather than
    /// written immediately, since it fires on every keystroke.
    pub async fn touch(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.touch();
        state.generation += 1;
        Ok(())
    }

    /// Note the outcome of a health check on the record. Returns false when
    /// the terminal is not registered.
    pub async fn mark_health(&self, id: &str, health: HealthState) -> bool {
        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(record) = state.records.get_mut(id) else {
                return false;
            };
            let changed = record.last_health != Some(health);
            record.set_health(health);
            if changed {
                Some(state.bump())
            } else {
                state.generation += 1;
                None
            }
        };
        if let Some(snapshot) = snapshot {
            self.persist(snapshot).await;
        }
        true
    }

    /// Write the current state if anything changed since the last write.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let snapshot = self.state.lock().await.snapshot();
        self.write(snapshot).await
    }

    async fn persist(&self, snapshot: Snapshot) {
        if let Err(e) = self.write(snapshot).await {
            warn!("Failed to persist terminal snapshot, continuing in memory: {}", e);
        }
    }

    async fn write(&self, snapshot: Snapshot) -> Result<(), PersistenceError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let mut persisted = self.persisted.lock().await;
        if snapshot.generation <= *persisted {
            return Ok(());
        }

        let store = Arc::clone(store);
        let generation = snapshot.generation;
        let records = snapshot.records;
        tokio::task::spawn_blocking(move || store.save(&records))
            .await
            .map_err(|e| PersistenceError::Rejected(format!("snapshot task failed: {}", e)))??;

        *persisted = generation;
        Ok(())
    }
}

impl Default for TerminalRegistry {
    fn default() -> Self {
        Self::new()
    }
}
