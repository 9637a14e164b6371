// ABOUTME: Library crate for the Claude-in-a-Box terminal-session daemon

//! A daemon that owns tmux-backed terminals for Claude-in-a-Box clients and
//! answers newline-delimited JSON requests on a Unix socket.

/// Daemon configuration.
pub mod config;
/// Socket protocol, server, client and lifecycle.
pub mod daemon;
/// Errors surfaced to clients.
pub mod error;
/// Worktree cleanup when terminals are destroyed.
pub mod git;
/// Terminal records and health states.
pub mod models;
/// Terminal registry, snapshots and health reconciliation.
pub mod session;
/// The tmux session backend.
pub mod tmux;

pub use config::DaemonConfig;
pub use error::DaemonError;
