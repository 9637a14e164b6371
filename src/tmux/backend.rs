// ABOUTME: Narrow interface over the terminal multiplexer used by the registry and reconciler
// Lets the reconciliation logic run against an in-memory fake instead of a real tmux server

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::tmux::error::BackendError;

/// Confirmation that the backend created a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub name: String,
    pub working_dir: PathBuf,
}

/// The terminal multiplexer the daemon drives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Create a detached session. Fails with `SessionExists` if the name is taken.
    async fn create(&self, name: &str, working_dir: &Path) -> Result<SessionHandle, BackendError>;

    /// Whether a session with exactly this name exists right now.
    async fn has_session(&self, name: &str) -> Result<bool, BackendError>;

    /// Every live session whose name starts with `prefix`.
    async fn list_sessions_matching(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Type `data` into the session's active pane.
    async fn send_input(&self, name: &str, data: &[u8]) -> Result<(), BackendError>;

    /// The tail of the session's visible output and scrollback.
    async fn read_output(&self, name: &str) -> Result<Vec<u8>, BackendError>;

    /// Fails with `SessionNotFound` if the session is already gone.
    async fn kill(&self, name: &str) -> Result<(), BackendError>;
}
