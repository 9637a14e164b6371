// ABOUTME: In-memory SessionBackend used by tests and by daemons started with --fake-backend
// Emulates just enough of a shell (echo) to observe input flowing through to output

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::tmux::backend::{SessionBackend, SessionHandle};
use crate::tmux::error::BackendError;

#[derive(Debug, Clone)]
struct FakeSession {
    working_dir: PathBuf,
    output: String,
    pending_line: String,
}

/// In-memory backend. Input is echoed back as output.
#[derive(Debug, Default)]
pub struct FakeBackend {
    sessions: Mutex<BTreeMap<String, FakeSession>>,
    unavailable: AtomicBool,
    create_calls: AtomicUsize,
    create_delay: Option<Duration>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside `create` before committing, widening race windows in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Make every call fail as if the tmux server could not be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Add a session behind the daemon's back.
    pub async fn insert_session(&self, name: &str, working_dir: &Path) {
        self.sessions.lock().await.insert(
            name.to_string(),
            FakeSession {
                working_dir: working_dir.to_path_buf(),
                output: String::new(),
                pending_line: String::new(),
            },
        );
    }

    /// Drop a session behind the daemon's back, like an external crash.
    pub async fn remove_session(&self, name: &str) -> bool {
        self.sessions.lock().await.remove(name).is_some()
    }

    /// Live session names, sorted.
    pub async fn session_names(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn working_dir(&self, name: &str) -> Option<PathBuf> {
        self.sessions
            .lock()
            .await
            .get(name)
            .map(|s| s.working_dir.clone())
    }

    /// How many `create` calls reached the backend.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::ServerUnavailable(
                "error connecting to fake tmux server".to_string(),
            ));
        }
        Ok(())
    }
}

fn run_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line == "echo" {
        return Some(String::new());
    }
    line.strip_prefix("echo ").map(|rest| rest.trim().to_string())
}

#[async_trait]
impl SessionBackend for FakeBackend {
    async fn create(&self, name: &str, working_dir: &Path) -> Result<SessionHandle, BackendError> {
        self.ensure_available()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(name) {
            return Err(BackendError::SessionExists(name.to_string()));
        }
        sessions.insert(
            name.to_string(),
            FakeSession {
                working_dir: working_dir.to_path_buf(),
                output: String::new(),
                pending_line: String::new(),
            },
        );
        Ok(SessionHandle {
            name: name.to_string(),
            working_dir: working_dir.to_path_buf(),
        })
    }

    async fn has_session(&self, name: &str) -> Result<bool, BackendError> {
        self.ensure_available()?;
        Ok(self.sessions.lock().await.contains_key(name))
    }

    async fn list_sessions_matching(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        self.ensure_available()?;
        Ok(self
            .sessions
            .lock()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn send_input(&self, name: &str, data: &[u8]) -> Result<(), BackendError> {
        self.ensure_available()?;
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| BackendError::SessionNotFound(name.to_string()))?;

        for ch in String::from_utf8_lossy(data).chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut session.pending_line);
                session.output.push_str(&line);
                session.output.push('\n');
                if let Some(result) = run_line(&line) {
                    session.output.push_str(&result);
                    session.output.push('\n');
                }
            } else {
                session.pending_line.push(ch);
            }
        }
        Ok(())
    }

    async fn read_output(&self, name: &str) -> Result<Vec<u8>, BackendError> {
        self.ensure_available()?;
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(name)
            .ok_or_else(|| BackendError::SessionNotFound(name.to_string()))?;
        let mut screen = session.output.clone();
        screen.push_str(&session.pending_line);
        Ok(screen.into_bytes())
    }

    async fn kill(&self, name: &str) -> Result<(), BackendError> {
        self.ensure_available()?;
        if self.sessions.lock().await.remove(name).is_none() {
            return Err(BackendError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }
}
