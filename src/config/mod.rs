// ABOUTME: Daemon configuration - defaults, optional TOML file, environment overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::models::{SessionNaming, DEFAULT_SESSION_PREFIX};

/// Overrides `socket_path`.
pub const ENV_SOCKET: &str = "CIAB_DAEMON_SOCKET";
/// Overrides `state_path`.
pub const ENV_STATE: &str = "CIAB_DAEMON_STATE";

/// Everything the daemon reads at startup. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Registry snapshot file
    pub state_path: PathBuf,
    /// Working directories under here are treated as disposable worktrees
    pub worktree_root: PathBuf,
    pub log_dir: PathBuf,
    pub session_prefix: String,
    /// `tmux -L` socket name; the user's default server when unset
    pub tmux_server: Option<String>,
    pub backend_timeout_ms: u64,
    pub output_tail_lines: usize,
    /// Keep ANSI colour and cursor sequences in `ReadOutput` data
    pub output_escape_sequences: bool,
    pub history_limit: u32,
    /// Command new sessions run instead of the login shell
    pub shell: Option<String>,
    /// 0 disables periodic reconciliation
    pub reconcile_interval_secs: u64,
    /// How often activity timestamps are flushed to the snapshot
    pub snapshot_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let base = base_dir();
        Self {
            socket_path: default_socket_path(),
            state_path: base.join("daemon").join("terminals.json"),
            worktree_root: base.join("worktrees"),
            log_dir: base.join("logs"),
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
            tmux_server: None,
            backend_timeout_ms: 5000,
            output_tail_lines: 200,
            output_escape_sequences: false,
            history_limit: 10_000,
            shell: None,
            reconcile_interval_secs: 30,
            snapshot_interval_secs: 5,
        }
    }
}

/// `~/.claude-in-a-box`, or a directory under the temp dir when there is no home.
pub fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".claude-in-a-box")
}

/// Where `load` looks when no path is given.
pub fn default_config_path() -> PathBuf {
    base_dir().join("daemon.toml")
}

/// Per-user so two users on one host never share a daemon.
pub fn default_socket_path() -> PathBuf {
    let uid = nix::unistd::getuid().as_raw();
    PathBuf::from("/tmp").join(format!("ciab-daemon-{}.sock", uid))
}

impl DaemonConfig {
    /// Load from `path` (which must exist) or from the default location if
    /// present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        debug!("Loaded daemon config from {}", path.display());
        Ok(config)
    }

    /// Apply environment overrides; empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(ENV_SOCKET).filter(|v| !v.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(state) = lookup(ENV_STATE).filter(|v| !v.is_empty()) {
            self.state_path = PathBuf::from(state);
        }
    }

    /// Bound on every tmux invocation.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// None when periodic reconciliation is disabled.
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    /// Never shorter than a second.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }

    /// Backing session naming for the configured prefix.
    pub fn naming(&self) -> SessionNaming {
        SessionNaming::new(self.session_prefix.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.session_prefix, "ciab_");
        assert_eq!(config.backend_timeout(), Duration::from_secs(5));
        assert_eq!(config.output_tail_lines, 200);
        assert_eq!(config.reconcile_interval(), Some(Duration::from_secs(30)));
        assert!(config.state_path.ends_with("daemon/terminals.json"));
        assert!(config
            .socket_path
            .to_string_lossy()
            .starts_with("/tmp/ciab-daemon-"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.toml");
        std::fs::write(
            &path,
            "session_prefix = \"box_\"\nreconcile_interval_secs = 0\ntmux_server = \"ciab-test\"\n",
        )
        .unwrap();

        let config = DaemonConfig::load_from_file(&path).unwrap();
        assert_eq!(config.session_prefix, "box_");
        assert_eq!(config.tmux_server.as_deref(), Some("ciab-test"));
        assert_eq!(config.reconcile_interval(), None);
        assert_eq!(config.history_limit, 10_000);
        assert_eq!(config.naming().backing_name("t1"), "box_t1");
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = DaemonConfig::load(Some(&temp_dir.path().join("nope.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.toml");
        std::fs::write(&path, "backend_timeout_ms = \"soon\"").unwrap();

        let err = DaemonConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_SOCKET, "/run/user/1000/ciab.sock"),
            (ENV_STATE, ""),
        ]
        .into_iter()
        .collect();

        let mut config = DaemonConfig::default();
        let default_state = config.state_path.clone();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.socket_path, PathBuf::from("/run/user/1000/ciab.sock"));
        // Empty values are ignored
        assert_eq!(config.state_path, default_state);
    }
}
