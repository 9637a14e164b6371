// ABOUTME: Error types for the tmux session backend
// Separates "tmux server unreachable" from "named session not found" so callers can retry or give up

use std::time::Duration;
use thiserror::Error;

/// Failures talking to tmux.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Tmux not installed on host")]
    NotInstalled,

    #[error("Tmux server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Tmux command `{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Tmux command failed: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BackendError {
    /// True when the multiplexer itself could not be reached, as opposed to a
    /// specific session being absent.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BackendError::NotInstalled
                | BackendError::ServerUnavailable(_)
                | BackendError::Timeout { .. }
        )
    }

    /// Map a failed tmux invocation onto an error kind by its stderr text.
    ///
    /// "no server running" is tmux telling us it has zero sessions, so it maps
    /// to `SessionNotFound` rather than `ServerUnavailable`.
    pub fn from_stderr(session: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("no server running")
            || lower.contains("can't find session")
            || lower.contains("can't find pane")
            || lower.contains("can't find window")
            || lower.contains("session not found")
        {
            BackendError::SessionNotFound(session.to_string())
        } else if lower.contains("duplicate session") {
            BackendError::SessionExists(session.to_string())
        } else if lower.contains("error connecting to")
            || lower.contains("permission denied")
            || lower.contains("connection refused")
            || lower.contains("server exited unexpectedly")
            || lower.contains("lost server")
        {
            BackendError::ServerUnavailable(stderr.trim().to_string())
        } else {
            BackendError::CommandFailed(stderr.trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_server_running_means_no_session() {
        let err = BackendError::from_stderr(
            "ciab_t1",
            "no server running on /tmp/tmux-1000/default\n",
        );
        assert!(matches!(err, BackendError::SessionNotFound(ref s) if s == "ciab_t1"));
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_connect_failure_is_unavailable() {
        let err = BackendError::from_stderr(
            "ciab_t1",
            "error connecting to /tmp/tmux-1000/default (Permission denied)",
        );
        assert!(matches!(err, BackendError::ServerUnavailable(_)));
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_duplicate_session() {
        let err = BackendError::from_stderr("ciab_t1", "duplicate session: ciab_t1");
        assert!(matches!(err, BackendError::SessionExists(_)));
    }

    #[test]
    fn test_unrecognised_stderr_is_command_failure() {
        let err = BackendError::from_stderr("ciab_t1", "unknown option -- z");
        assert!(matches!(err, BackendError::CommandFailed(ref m) if m == "unknown option -- z"));
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_timeout_is_unavailable() {
        let err = BackendError::Timeout {
            command: "has-session".to_string(),
            after: Duration::from_secs(5),
        };
        assert!(err.is_unavailable());
    }
}
