// ABOUTME: Daemon-level error taxonomy and its mapping onto wire error kinds

use std::path::PathBuf;
use thiserror::Error;

use crate::daemon::protocol::{ErrorKind, ProtocolError, Response};
use crate::git::CleanupError;
use crate::session::{PersistenceError, RegistryError};
use crate::tmux::BackendError;

/// Errors a request or the daemon lifecycle can end in.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Terminal not found: {0}")]
    NotFound(String),

    #[error("Terminal {0} has a live session but is not registered; adopt it first")]
    Unregistered(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Session backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Session backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("Another daemon is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("{0} exists and is not a socket; refusing to replace it")]
    NotASocket(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for DaemonError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::SessionNotFound(name) => {
                DaemonError::NotFound(format!("backend session {} is gone", name))
            }
            BackendError::SessionExists(name) => {
                DaemonError::Conflict(format!("backend session {} already exists", name))
            }
            e if e.is_unavailable() => DaemonError::BackendUnavailable(e.to_string()),
            e => DaemonError::Backend(e.to_string()),
        }
    }
}

impl From<RegistryError> for DaemonError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => DaemonError::NotFound(id),
            e => DaemonError::Conflict(e.to_string()),
        }
    }
}

impl DaemonError {
    /// The wire kind a client sees.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Protocol(_) => ErrorKind::Protocol,
            DaemonError::NotFound(_) => ErrorKind::NotFound,
            DaemonError::Unregistered(_) => ErrorKind::Unregistered,
            DaemonError::Conflict(_) => ErrorKind::Conflict,
            DaemonError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            DaemonError::Backend(_) => ErrorKind::Backend,
            DaemonError::Persistence(_)
            | DaemonError::Cleanup(_)
            | DaemonError::AlreadyRunning(_)
            | DaemonError::NotASocket(_)
            | DaemonError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn into_response(self) -> Response {
        Response::error(self.kind(), self.to_string())
    }
}
