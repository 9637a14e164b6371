// ABOUTME: Async client for the daemon socket, used by the CLI, the startup probe and tests
// One request, one response, over a connection kept open between calls

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::daemon::protocol::{read_frame, write_message, ErrorKind, ProtocolError, Request, Response};
use crate::models::{HealthState, TerminalId, TerminalRecord};

/// Connect and per-response timeout used by `connect`.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a client call failed.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Daemon did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Daemon closed the connection")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Daemon error ({kind:?}): {message}")]
    Daemon { kind: ErrorKind, message: String },
    #[error("Unexpected response: {0:?}")]
    Unexpected(Box<Response>),
}

impl ClientError {
    /// The wire error kind, when the daemon answered with an error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Daemon { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Answer to `CheckSessionHealth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReply {
    pub id: TerminalId,
    pub state: HealthState,
    pub has_session: Option<bool>,
    pub message: Option<String>,
}

/// A connection to a running daemon.
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    buf: Vec<u8>,
    timeout: Duration,
}

impl DaemonClient {
    /// Connect with the default timeout.
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        Self::connect_with_timeout(path, DEFAULT_CLIENT_TIMEOUT).await
    }

    /// Connect, waiting at most `limit` for the socket and for each response after.
    pub async fn connect_with_timeout(path: &Path, limit: Duration) -> Result<Self, ClientError> {
        let stream = timeout(limit, UnixStream::connect(path))
            .await
            .map_err(|_| ClientError::Timeout(limit))?
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            buf: Vec::new(),
            timeout: limit,
        })
    }

    /// Whether a daemon is answering pings on `path`.
    pub async fn probe(path: &Path, limit: Duration) -> bool {
        match Self::connect_with_timeout(path, limit).await {
            Ok(mut client) => client.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Send a request and return whatever the daemon answered, errors included.
    pub async fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
        write_message(&mut self.writer, request).await?;
        self.read_response().await
    }

    /// Send a pre-encoded line verbatim, for exercising the daemon's parser.
    pub async fn send_raw(&mut self, line: &str) -> Result<Response, ClientError> {
        let mut frame = line.trim_end_matches('\n').to_string();
        frame.push('\n');
        write_message_bytes(&mut self.writer, frame.as_bytes()).await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<Response, ClientError> {
        let frame = timeout(self.timeout, read_frame(&mut self.reader, &mut self.buf))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        let line = frame.ok_or(ClientError::Closed)?;
        serde_json::from_str(&line).map_err(|e| ProtocolError::Malformed(e.to_string()).into())
    }

    async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        match self.request(&request).await? {
            Response::Error { kind, message } => Err(ClientError::Daemon { kind, message }),
            response => Ok(response),
        }
    }

    /// Fails unless the daemon answers `Pong`.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match self.call(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Create a terminal and its backing session. Returns the terminal id.
    pub async fn create_terminal(
        &mut self,
        name: &str,
        working_directory: &Path,
        config_id: Option<&str>,
    ) -> Result<TerminalId, ClientError> {
        let request = Request::CreateTerminal {
            name: name.to_string(),
            working_directory: working_directory.to_path_buf(),
            config_id: config_id.map(str::to_string),
        };
        match self.call(request).await? {
            Response::TerminalCreated { id } => Ok(id),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Type `data` into the terminal; newlines press Enter.
    pub async fn send_input(&mut self, id: &str, data: &str) -> Result<(), ClientError> {
        let request = Request::SendInput {
            id: id.to_string(),
            data: data.to_string(),
        };
        self.expect_success(request).await
    }

    /// Recent output of the terminal.
    pub async fn read_output(&mut self, id: &str) -> Result<String, ClientError> {
        match self.call(Request::ReadOutput { id: id.to_string() }).await? {
            Response::Output { data, .. } => Ok(data),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Kill the session, drop the record and clean up its worktree.
    pub async fn kill_terminal(&mut self, id: &str) -> Result<(), ClientError> {
        self.expect_success(Request::KillTerminal { id: id.to_string() })
            .await
    }

    pub async fn list_terminals(&mut self) -> Result<Vec<TerminalRecord>, ClientError> {
        match self.call(Request::ListTerminals).await? {
            Response::TerminalList { terminals } => Ok(terminals),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Ask the daemon to check one id against the backend.
    pub async fn check_health(&mut self, id: &str) -> Result<HealthReply, ClientError> {
        match self
            .call(Request::CheckSessionHealth { id: id.to_string() })
            .await?
        {
            Response::SessionHealth {
                id,
                state,
                has_session,
                message,
            } => Ok(HealthReply {
                id,
                state,
                has_session,
                message,
            }),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Register a live session that has no record.
    pub async fn adopt_terminal(
        &mut self,
        id: &str,
        working_directory: &Path,
        config_id: Option<&str>,
    ) -> Result<TerminalId, ClientError> {
        let request = Request::AdoptTerminal {
            id: id.to_string(),
            working_directory: working_directory.to_path_buf(),
            config_id: config_id.map(str::to_string),
        };
        match self.call(request).await? {
            Response::TerminalCreated { id } => Ok(id),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    pub async fn find_by_config(&mut self, config_id: &str) -> Result<Option<TerminalRecord>, ClientError> {
        let request = Request::FindByConfig {
            config_id: config_id.to_string(),
        };
        match self.call(request).await? {
            Response::Terminal { terminal } => Ok(terminal),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    /// Ask the daemon to stop. It answers before closing.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        match self.call(Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }

    async fn expect_success(&mut self, request: Request) -> Result<(), ClientError> {
        match self.call(request).await? {
            Response::Success => Ok(()),
            other => Err(ClientError::Unexpected(Box::new(other))),
        }
    }
}

async fn write_message_bytes(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), ProtocolError> {
    use tokio::io::AsyncWriteExt;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("none.sock");

        let err = DaemonClient::connect(&path).await.err().unwrap();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(!DaemonClient::probe(&path, Duration::from_millis(200)).await);
    }

    #[test]
    fn test_error_kind_exposed() {
        let err = ClientError::Daemon {
            kind: ErrorKind::Conflict,
            message: "taken".to_string(),
        };
        assert_eq!(err.kind(), Some(ErrorKind::Conflict));
        assert_eq!(ClientError::Closed.kind(), None);
    }
}
