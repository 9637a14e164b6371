// ABOUTME: Terminal registry, its persistence, and health reconciliation against tmux

/// Backend health checks.
pub mod health;
/// Snapshot stores.
pub mod persistence;
/// The terminal registry.
pub mod registry;

pub use health::{HealthReconciler, HealthReport};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, PersistenceError, SnapshotStore};
pub use registry::{RegistryError, TerminalRegistry};
