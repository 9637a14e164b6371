// ABOUTME: Core data models for daemon-managed terminals and their health

/// Registry record and naming.
pub mod terminal;

pub use terminal::{
    ConfigId, HealthState, SessionNaming, TerminalId, TerminalRecord, DEFAULT_SESSION_PREFIX,
};
