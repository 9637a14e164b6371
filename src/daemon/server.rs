// ABOUTME: Unix socket server - one task per client connection, all sharing one terminal registry
// Handlers never hold the registry lock across a backend call

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::daemon::client::{ClientError, DaemonClient};
use crate::daemon::protocol::{decode_request, read_frame, write_message, ProtocolError, Request, Response};
use crate::error::DaemonError;
use crate::git::{CleanupOutcome, WorkspaceHook};
use crate::models::{ConfigId, SessionNaming, TerminalId, TerminalRecord};
use crate::session::{HealthReconciler, TerminalRegistry};
use crate::tmux::{BackendError, SessionBackend};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

struct DaemonState {
    registry: Arc<TerminalRegistry>,
    backend: Arc<dyn SessionBackend>,
    reconciler: Arc<HealthReconciler>,
    hook: Arc<dyn WorkspaceHook>,
    naming: SessionNaming,
    shutdown: watch::Sender<bool>,
    next_connection: AtomicU64,
}

/// Shared request handling for every connection. Cheap to clone.
#[derive(Clone)]
pub struct DaemonServer {
    state: Arc<DaemonState>,
}

impl DaemonServer {
    /// Wire a server to its registry, backend and cleanup hook.
    pub fn new(
        registry: Arc<TerminalRegistry>,
        backend: Arc<dyn SessionBackend>,
        hook: Arc<dyn WorkspaceHook>,
        naming: SessionNaming,
    ) -> Self {
        let reconciler = Arc::new(HealthReconciler::new(
            Arc::clone(&registry),
            Arc::clone(&backend),
            naming.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(DaemonState {
                registry,
                backend,
                reconciler,
                hook,
                naming,
                shutdown,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TerminalRegistry> {
        &self.state.registry
    }

    pub fn reconciler(&self) -> &Arc<HealthReconciler> {
        &self.state.reconciler
    }

    /// Flips to `true` once shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.state.shutdown.subscribe()
    }

    /// Stop accepting, close connections and end background tasks.
    pub fn trigger_shutdown(&self) {
        self.state.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.state.shutdown.borrow()
    }

    /// Accept connections until shutdown is signalled.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), DaemonError> {
        let mut shutdown = self.shutdown_signal();
        info!("Daemon accepting connections");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let conn_id = self.state.next_connection.fetch_add(1, Ordering::Relaxed);
                        let server = self.clone();
                        tokio::spawn(async move {
                            debug!("Connection {} opened", conn_id);
                            match server.handle_connection(stream).await {
                                Ok(()) => debug!("Connection {} closed", conn_id),
                                Err(e) => warn!("Connection {} dropped: {}", conn_id, e),
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                () = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("Daemon stopped accepting connections");
        Ok(())
    }

    /// Answer requests from one client in order until it disconnects.
    pub async fn handle_connection(&self, stream: UnixStream) -> Result<(), DaemonError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        let mut shutdown = self.shutdown_signal();

        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader, &mut buf) => frame,
                () = wait_for_shutdown(&mut shutdown) => return Ok(()),
            };

            let response = match frame {
                Ok(None) => return Ok(()),
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match decode_request(&line) {
                    Ok(request) => self.handle_request(request).await,
                    Err(e) => {
                        debug!("Rejected message: {}", e);
                        DaemonError::from(e).into_response()
                    }
                },
                Err(e) if e.is_recoverable() => DaemonError::from(e).into_response(),
                Err(e) => {
                    if matches!(e, ProtocolError::FrameTooLarge { .. }) {
                        let reply = DaemonError::Protocol(ProtocolError::FrameTooLarge {
                            limit: crate::daemon::protocol::MAX_FRAME_BYTES,
                        })
                        .into_response();
                        let _ = write_message(&mut write_half, &reply).await;
                    }
                    return Err(e.into());
                }
            };

            write_message(&mut write_half, &response).await?;
        }
    }

    /// Answer one request. Failures become `Response::Error`.
    pub async fn handle_request(&self, request: Request) -> Response {
        let result = match request {
            Request::Ping => Ok(Response::Pong),
            Request::CreateTerminal {
                name,
                working_directory,
                config_id,
            } => self.create_terminal(name, working_directory, config_id).await,
            Request::SendInput { id, data } => self.send_input(&id, &data).await,
            Request::ReadOutput { id } => self.read_output(&id).await,
            Request::KillTerminal { id } => self.kill_terminal(&id).await,
            Request::ListTerminals => Ok(Response::TerminalList {
                terminals: self.state.registry.list().await,
            }),
            Request::CheckSessionHealth { id } => Ok(self.check_health(&id).await),
            Request::AdoptTerminal {
                id,
                working_directory,
                config_id,
            } => self.adopt_terminal(id, working_directory, config_id).await,
            Request::FindByConfig { config_id } => Ok(Response::Terminal {
                terminal: self.state.registry.lookup_by_config_id(&config_id).await,
            }),
            Request::Shutdown => {
                info!("Shutdown requested by client");
                self.trigger_shutdown();
                Ok(Response::ShuttingDown)
            }
        };

        result.unwrap_or_else(|e| {
            debug!("Request failed: {}", e);
            e.into_response()
        })
    }

    async fn create_terminal(
        &self,
        name: TerminalId,
        working_directory: PathBuf,
        config_id: Option<ConfigId>,
    ) -> Result<Response, DaemonError> {
        if name.trim().is_empty() {
            return Err(ProtocolError::Malformed("terminal name must not be empty".to_string()).into());
        }

        let backing = self.state.naming.backing_name(&name);
        let config_id = config_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.state.registry.reserve(&name, &config_id, &backing).await?;

        let handle = match self.state.backend.create(&backing, &working_directory).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state.registry.release(&name).await;
                warn!("Failed to create backend session for terminal {}: {}", name, e);
                return Err(e.into());
            }
        };

        let record = TerminalRecord::new(name.clone(), config_id, handle.name, handle.working_dir);
        if let Err(e) = self.state.registry.register(record).await {
            // Unreachable while the reservation holds, but never leave an orphan
            self.state.registry.release(&name).await;
            if let Err(kill_err) = self.state.backend.kill(&backing).await {
                warn!("Failed to kill orphaned session {}: {}", backing, kill_err);
            }
            return Err(e.into());
        }

        Ok(Response::TerminalCreated { id: name })
    }

    /// The record for `id`. A miss is checked against the backend so callers
    /// can tell a vanished terminal from one the registry forgot.
    async fn resolve(&self, id: &str) -> Result<TerminalRecord, DaemonError> {
        if let Some(record) = self.state.registry.lookup(id).await {
            return Ok(record);
        }

        let backing = self.state.naming.backing_name(id);
        match self.state.backend.has_session(&backing).await {
            Ok(true) => Err(DaemonError::Unregistered(id.to_string())),
            Ok(false) => Err(DaemonError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn send_input(&self, id: &str, data: &str) -> Result<Response, DaemonError> {
        let record = self.resolve(id).await?;
        self.state
            .backend
            .send_input(&record.backing_session_name, data.as_bytes())
            .await?;
        self.touch(id).await;
        Ok(Response::Success)
    }

    async fn read_output(&self, id: &str) -> Result<Response, DaemonError> {
        let record = self.resolve(id).await?;
        let output = self
            .state
            .backend
            .read_output(&record.backing_session_name)
            .await?;
        self.touch(id).await;
        Ok(Response::Output {
            id: id.to_string(),
            data: String::from_utf8_lossy(&output).into_owned(),
        })
    }

    async fn touch(&self, id: &str) {
        // A concurrent kill may have removed it since resolve
        if let Err(e) = self.state.registry.touch(id).await {
            debug!("Skipped activity update: {}", e);
        }
    }

    async fn kill_terminal(&self, id: &str) -> Result<Response, DaemonError> {
        let record = self.resolve(id).await?;

        match self.state.backend.kill(&record.backing_session_name).await {
            Ok(()) => {}
            Err(BackendError::SessionNotFound(_)) => {
                debug!("Session {} was already gone", record.backing_session_name);
            }
            // The session may still be alive; keep the record
            Err(e) => return Err(e.into()),
        }

        self.state.registry.remove(id).await;

        let sharing: Vec<TerminalId> = self
            .state
            .registry
            .list()
            .await
            .into_iter()
            .filter(|other| other.working_directory == record.working_directory)
            .map(|other| other.id)
            .collect();
        if !sharing.is_empty() {
            info!(
                "Destroyed terminal {}; {} still in use by {}",
                id,
                record.working_directory.display(),
                sharing.join(", ")
            );
            return Ok(Response::Success);
        }

        match self.state.hook.on_destroy(&record.working_directory).await {
            Ok(CleanupOutcome::NotManaged) => {}
            Ok(CleanupOutcome::Removed { path, .. }) => {
                info!("Cleaned up worktree {} for terminal {}", path.display(), id);
            }
            Err(e) => {
                let err = DaemonError::Cleanup(e);
                warn!("Terminal {} destroyed but workspace cleanup failed: {}", id, err);
            }
        }

        info!("Destroyed terminal {}", id);
        Ok(Response::Success)
    }

    async fn check_health(&self, id: &str) -> Response {
        let report = self.state.reconciler.check(id).await;
        Response::SessionHealth {
            id: report.id,
            has_session: report.state.has_session(),
            state: report.state,
            message: report.message,
        }
    }

    async fn adopt_terminal(
        &self,
        id: TerminalId,
        working_directory: PathBuf,
        config_id: Option<ConfigId>,
    ) -> Result<Response, DaemonError> {
        let backing = self.state.naming.backing_name(&id);
        let config_id = config_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.state.registry.reserve(&id, &config_id, &backing).await?;

        match self.state.backend.has_session(&backing).await {
            Ok(true) => {}
            Ok(false) => {
                self.state.registry.release(&id).await;
                return Err(DaemonError::NotFound(format!(
                    "no backend session {} to adopt",
                    backing
                )));
            }
            Err(e) => {
                self.state.registry.release(&id).await;
                return Err(e.into());
            }
        }

        let record = TerminalRecord::new(id.clone(), config_id, backing, working_directory);
        if let Err(e) = self.state.registry.register(record).await {
            self.state.registry.release(&id).await;
            return Err(e.into());
        }

        info!("Adopted existing session for terminal {}", id);
        Ok(Response::TerminalCreated { id })
    }
}

/// Resolves once shutdown has been signalled or every sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // The `watch::Ref` is !Send and must not outlive this statement
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Bind the daemon socket, refusing to displace a live daemon. Only a socket
/// that actively refuses connections is taken as left over from a crash and
/// replaced; any other file at `path` is left alone.
pub async fn bind_socket(path: &Path) -> Result<UnixListener, DaemonError> {
    match path.symlink_metadata() {
        Ok(meta) if !meta.file_type().is_socket() => {
            return Err(DaemonError::NotASocket(path.to_path_buf()));
        }
        Ok(_) => match DaemonClient::connect_with_timeout(path, PROBE_TIMEOUT).await {
            Ok(mut client) => {
                if let Err(e) = client.ping().await {
                    warn!("Socket {} is held by a process that does not answer pings: {}", path.display(), e);
                }
                return Err(DaemonError::AlreadyRunning(path.to_path_buf()));
            }
            Err(ClientError::Connect { source, .. }) => match source.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    info!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path)?;
                }
                std::io::ErrorKind::NotFound => {}
                _ => return Err(source.into()),
            },
            // Accepting but too slow to answer is still someone's socket
            Err(_) => return Err(DaemonError::AlreadyRunning(path.to_path_buf())),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    info!("Listening on {}", path.display());
    Ok(listener)
}
