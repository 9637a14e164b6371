// ABOUTME: Wire protocol between daemon and clients
// Newline-delimited JSON, each message tagged by "type" with its fields under "payload"

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::{ConfigId, HealthState, TerminalId, TerminalRecord};

/// Frames longer than this are rejected and the connection is dropped.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// ============================================
// Client → Daemon
// ============================================

/// A client request, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Request {
    /// Liveness check; answered with `Pong`.
    Ping,
    /// Start a backing session in `working_directory` and register it as `name`.
    CreateTerminal {
        name: TerminalId,
        working_directory: PathBuf,
        /// Generated when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_id: Option<ConfigId>,
    },
    /// Type `data` into the terminal; each newline presses Enter.
    SendInput {
        id: TerminalId,
        data: String,
    },
    /// The tail of the terminal's output.
    ReadOutput {
        id: TerminalId,
    },
    /// Kill the backing session, drop the record and clean up its worktree.
    KillTerminal {
        id: TerminalId,
    },
    /// Every registered terminal.
    ListTerminals,
    /// Ask the backend whether the terminal's session exists right now.
    CheckSessionHealth {
        id: TerminalId,
    },
    /// Re-register a live backend session the registry lost track of
    AdoptTerminal {
        id: TerminalId,
        working_directory: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_id: Option<ConfigId>,
    },
    /// The terminal created for a client configuration, if any.
    FindByConfig {
        config_id: ConfigId,
    },
    /// Stop the daemon after answering.
    Shutdown,
}

/// Every tag `Request` accepts, used to tell unknown types from bad payloads.
pub const REQUEST_TYPES: &[&str] = &[
    "Ping",
    "CreateTerminal",
    "SendInput",
    "ReadOutput",
    "KillTerminal",
    "ListTerminals",
    "CheckSessionHealth",
    "AdoptTerminal",
    "FindByConfig",
    "Shutdown",
];

// ============================================
// Daemon → Client
// ============================================

/// The daemon's answer to exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Response {
    Pong,
    TerminalCreated {
        id: TerminalId,
    },
    Output {
        id: TerminalId,
        data: String,
    },
    TerminalList {
        terminals: Vec<TerminalRecord>,
    },
    SessionHealth {
        id: TerminalId,
        state: HealthState,
        /// null when the backend could not be asked
        has_session: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Terminal {
        terminal: Option<TerminalRecord>,
    },
    Success,
    ShuttingDown,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Lets callers choose between retrying and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request itself was unusable
    Protocol,
    /// No record and no backend session
    NotFound,
    /// A backend session exists but no record does; AdoptTerminal recovers it
    Unregistered,
    /// Id, config id or session name already taken
    Conflict,
    /// tmux could not be reached; worth retrying
    BackendUnavailable,
    /// tmux answered with a failure
    Backend,
    /// Daemon-side failure unrelated to the request
    Internal,
}

/// Failures reading or decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unknown request type: {0}")]
    UnknownType(String),
    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the connection can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::Malformed(_) | ProtocolError::UnknownType(_))
    }
}

/// Decode one line, telling an unknown `type` apart from a bad payload.
pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?;

    if !REQUEST_TYPES.contains(&tag) {
        return Err(ProtocolError::UnknownType(tag.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Read one newline-terminated frame. `Ok(None)` at a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    read_frame_limited(reader, buf, MAX_FRAME_BYTES).await
}

/// Read one line of at most `limit` bytes. `Ok(None)` at end of stream.
pub async fn read_frame_limited<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > limit {
        return Err(ProtocolError::FrameTooLarge { limit });
    }

    let line = std::str::from_utf8(buf)
        .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8: {}", e)))?;
    Ok(Some(line.to_string()))
}

/// Write `message` as one JSON line and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn test_decode_create_terminal() {
        let request = decode_request(
            r#"{"type":"CreateTerminal","payload":{"name":"t1","working_directory":"/repo"}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            Request::CreateTerminal {
                name: "t1".to_string(),
                working_directory: PathBuf::from("/repo"),
                config_id: None,
            }
        );
    }

    #[test]
    fn test_decode_unit_request_without_payload() {
        assert_eq!(decode_request(r#"{"type":"Ping"}"#).unwrap(), Request::Ping);
        assert_eq!(
            decode_request(r#"{"type":"ListTerminals"}"#).unwrap(),
            Request::ListTerminals
        );
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        let err = decode_request(r#"{"type":"Reboot"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "Reboot"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_bad_payload_is_malformed() {
        let err = decode_request(r#"{"type":"SendInput","payload":{"id":"t1"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err = decode_request("not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err = decode_request(r#"{"payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_health_response_wire_shape() {
        let response = Response::SessionHealth {
            id: "t1".to_string(),
            state: HealthState::Unknown,
            has_session: None,
            message: Some("tmux timed out".to_string()),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "SessionHealth",
                "payload": {
                    "id": "t1",
                    "state": "unknown",
                    "has_session": null,
                    "message": "tmux timed out"
                }
            })
        );
    }

    #[test]
    fn test_error_response_wire_shape() {
        let value =
            serde_json::to_value(Response::error(ErrorKind::BackendUnavailable, "no tmux")).unwrap();
        assert_eq!(
            value,
            json!({"type": "Error", "payload": {"kind": "backend_unavailable", "message": "no tmux"}})
        );
        assert_eq!(serde_json::to_value(Response::Pong).unwrap(), json!({"type": "Pong"}));
    }

    #[tokio::test]
    async fn test_frames_split_on_newlines() {
        let input: &[u8] = b"{\"type\":\"Ping\"}\r\n\n{\"type\":\"Shutdown\"}";
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();

        assert_eq!(
            read_frame(&mut reader, &mut buf).await.unwrap().as_deref(),
            Some(r#"{"type":"Ping"}"#)
        );
        assert_eq!(read_frame(&mut reader, &mut buf).await.unwrap().as_deref(), Some(""));
        assert_eq!(
            read_frame(&mut reader, &mut buf).await.unwrap().as_deref(),
            Some(r#"{"type":"Shutdown"}"#)
        );
        assert!(read_frame(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let input = vec![b'x'; 64];
        let mut reader = BufReader::new(input.as_slice());
        let mut buf = Vec::new();

        let err = read_frame_limited(&mut reader, &mut buf, 16).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { limit: 16 }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        let input = b"0123456789abcdef\n".to_vec();
        let mut reader = BufReader::new(input.as_slice());
        let mut buf = Vec::new();

        let frame = read_frame_limited(&mut reader, &mut buf, 16).await.unwrap();
        assert_eq!(frame.as_deref(), Some("0123456789abcdef"));
    }

    #[tokio::test]
    async fn test_write_message_appends_newline() {
        let mut out = Vec::new();
        write_message(&mut out, &Request::Ping).await.unwrap();
        assert_eq!(out, b"{\"type\":\"Ping\"}\n");
    }
}
