// ABOUTME: SessionBackend implementation that drives the host tmux server
// Every tmux invocation runs under a bounded timeout so a wedged server cannot hang a client

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::tmux::backend::{SessionBackend, SessionHandle};
use crate::tmux::capture::{trim_trailing_blank_lines, CaptureOptions};
use crate::tmux::error::BackendError;

struct TmuxOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

/// Drives a tmux server through its command line.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    program: String,
    /// Dedicated tmux server socket name (`tmux -L`), None for the user's default server
    server_name: Option<String>,
    timeout: Duration,
    history_limit: u32,
    shell: Option<String>,
    capture: CaptureOptions,
}

impl TmuxBackend {
    /// Backend for the tmux server, timeouts and capture window in `config`.
    pub fn from_config(config: &DaemonConfig) -> Self {
        let mut capture = CaptureOptions::tail(config.output_tail_lines);
        if config.output_escape_sequences {
            capture = capture.with_escape_sequences();
        }
        Self {
            program: "tmux".to_string(),
            server_name: config.tmux_server.clone(),
            timeout: config.backend_timeout(),
            history_limit: config.history_limit,
            shell: config.shell.clone(),
            capture,
        }
    }

    /// Check that tmux is installed and report its version
    pub async fn check_tmux_installed(&self) -> Result<String, BackendError> {
        let output = self.run(vec!["-V".to_string()]).await?;
        if !output.success {
            return Err(BackendError::NotInstalled);
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Using {}", version);
        Ok(version)
    }

    async fn run(&self, args: Vec<String>) -> Result<TmuxOutput, BackendError> {
        let mut cmd = Command::new(&self.program);
        if let Some(server) = &self.server_name {
            cmd.arg("-L").arg(server);
        }
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let command = args.first().cloned().unwrap_or_default();
        debug!("tmux {}", args.join(" "));

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotInstalled);
            }
            Ok(Err(e)) => return Err(BackendError::IoError(e)),
            Err(_) => {
                warn!("tmux {} timed out after {:?}", command, self.timeout);
                return Err(BackendError::Timeout {
                    command,
                    after: self.timeout,
                });
            }
        };

        Ok(TmuxOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Exact-match session target; a bare name would prefix-match other sessions.
pub fn session_target(name: &str) -> String {
    format!("={}", name)
}

/// Exact-match target for a session's active pane.
pub fn pane_target(name: &str) -> String {
    format!("={}:", name)
}

/// Build one chained tmux invocation that types `text` literally, turning
/// each newline into an Enter key press.
pub fn send_keys_args(name: &str, text: &str) -> Vec<String> {
    let target = pane_target(name);
    let segments: Vec<&str> = text.split('\n').collect();
    let mut args: Vec<String> = Vec::new();

    for (i, segment) in segments.iter().enumerate() {
        if !segment.is_empty() {
            if !args.is_empty() {
                args.push(";".to_string());
            }
            args.extend(
                ["send-keys", "-t", target.as_str(), "-l", "--", *segment]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        if i + 1 < segments.len() {
            if !args.is_empty() {
                args.push(";".to_string());
            }
            args.extend(
                ["send-keys", "-t", target.as_str(), "Enter"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
    }

    args
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    async fn create(&self, name: &str, working_dir: &Path) -> Result<SessionHandle, BackendError> {
        let mut args = vec![
            "new-session".to_string(),
            "-d".to_string(), // Detached
            "-s".to_string(),
            name.to_string(),
            "-c".to_string(),
            working_dir.to_string_lossy().to_string(),
        ];
        if let Some(shell) = &self.shell {
            args.push(shell.clone());
        }

        let output = self.run(args).await?;
        if !output.success {
            return Err(BackendError::from_stderr(name, &output.stderr));
        }

        let history = self
            .run(vec![
                "set-option".to_string(),
                "-t".to_string(),
                session_target(name),
                "history-limit".to_string(),
                self.history_limit.to_string(),
            ])
            .await?;
        if !history.success {
            warn!("Failed to set history-limit on {}: {}", name, history.stderr.trim());
        }

        info!("Created tmux session {} in {}", name, working_dir.display());
        Ok(SessionHandle {
            name: name.to_string(),
            working_dir: working_dir.to_path_buf(),
        })
    }

    async fn has_session(&self, name: &str) -> Result<bool, BackendError> {
        let output = self
            .run(vec![
                "has-session".to_string(),
                "-t".to_string(),
                session_target(name),
            ])
            .await?;

        if output.success {
            return Ok(true);
        }
        match BackendError::from_stderr(name, &output.stderr) {
            BackendError::SessionNotFound(_) => Ok(false),
            // Anything else, a silent failure included, leaves the answer unknown
            other => Err(other),
        }
    }

    async fn list_sessions_matching(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let output = self
            .run(vec![
                "list-sessions".to_string(),
                "-F".to_string(),
                "#{session_name}".to_string(),
            ])
            .await?;

        if output.success {
            let sessions = String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|s| s.starts_with(prefix))
                .map(String::from)
                .collect();
            return Ok(sessions);
        }
        match BackendError::from_stderr(prefix, &output.stderr) {
            BackendError::SessionNotFound(_) => Ok(Vec::new()),
            other => Err(other),
        }
    }

    async fn send_input(&self, name: &str, data: &[u8]) -> Result<(), BackendError> {
        let text = String::from_utf8_lossy(data);
        let args = send_keys_args(name, &text);
        if args.is_empty() {
            return Ok(());
        }

        let output = self.run(args).await?;
        if !output.success {
            return Err(BackendError::from_stderr(name, &output.stderr));
        }
        Ok(())
    }

    async fn read_output(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        let output = self.run(self.capture.to_args(&pane_target(name))).await?;
        if !output.success {
            return Err(BackendError::from_stderr(name, &output.stderr));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(trim_trailing_blank_lines(&text).as_bytes().to_vec())
    }

    async fn kill(&self, name: &str) -> Result<(), BackendError> {
        let output = self
            .run(vec![
                "kill-session".to_string(),
                "-t".to_string(),
                session_target(name),
            ])
            .await?;
        if !output.success {
            return Err(BackendError::from_stderr(name, &output.stderr));
        }
        info!("Killed tmux session {}", name);
        Ok(())
    }
}
