// ABOUTME: The terminal-session daemon - wire protocol, socket server, client and lifecycle

/// Client side of the socket.
pub mod client;
/// Wire messages and newline framing.
pub mod protocol;
/// Startup and shutdown.
pub mod runtime;
/// Per-connection request handling.
pub mod server;

pub use client::{ClientError, DaemonClient, HealthReply};
pub use protocol::{ErrorKind, ProtocolError, Request, Response};
pub use runtime::run;
pub use server::{bind_socket, DaemonServer};
