// ABOUTME: Terminal data model - a registry record for one tmux-backed terminal slot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;

/// Caller-chosen terminal name, unique among live records.
pub type TerminalId = String;
/// Identifies the client configuration a terminal was created for.
pub type ConfigId = String;

pub const DEFAULT_SESSION_PREFIX: &str = "ciab_";

/// Health of a terminal as observed by querying the backend. Never cached as
/// authoritative across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Missing,
    UnregisteredButPresent,
    Unknown,
}

impl HealthState {
    /// Whether a backend session exists; None when the backend could not be asked.
    pub fn has_session(&self) -> Option<bool> {
        match self {
            HealthState::Healthy | HealthState::UnregisteredButPresent => Some(true),
            HealthState::Missing => Some(false),
            HealthState::Unknown => None,
        }
    }

    /// One-character status glyph for listings.
    pub fn indicator(&self) -> &'static str {
        match self {
            HealthState::Healthy => "●",
            HealthState::Missing => "✗",
            HealthState::UnregisteredButPresent => "◌",
            HealthState::Unknown => "?",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthState::Healthy => "healthy",
            HealthState::Missing => "missing",
            HealthState::UnregisteredButPresent => "unregistered_but_present",
            HealthState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Registry entry for one terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub id: TerminalId,
    pub config_id: ConfigId,
    pub backing_session_name: String,
    pub working_directory: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Outcome of the most recent reconciliation pass. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health: Option<HealthState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

impl TerminalRecord {
    /// A fresh record, healthy as of now.
    pub fn new(
        id: TerminalId,
        config_id: ConfigId,
        backing_session_name: String,
        working_directory: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            config_id,
            backing_session_name,
            working_directory,
            created_at: now,
            last_activity: now,
            last_health: Some(HealthState::Healthy),
            last_checked: Some(now),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn set_health(&mut self, state: HealthState) {
        self.last_health = Some(state);
        self.last_checked = Some(Utc::now());
    }
}

/// Derives backing tmux session names from terminal ids so reconciliation can
/// find a terminal's session without consulting the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNaming {
    prefix: String,
}

impl SessionNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The tmux session name for `id`. Distinct ids always map to distinct names.
    pub fn backing_name(&self, id: &str) -> String {
        format!("{}{}", self.prefix, Self::sanitize_tmux_name(id))
    }

    /// Escape everything tmux treats specially in a target (`.`, `:`) and
    /// anything shell-hostile. `_` doubles and other bytes become `_xx` hex,
    /// so distinct ids never share a session name.
    pub fn sanitize_tmux_name(name: &str) -> String {
        let mut escaped = String::with_capacity(name.len());
        for byte in name.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => escaped.push(char::from(byte)),
                b'_' => escaped.push_str("__"),
                _ => {
                    let _ = write!(escaped, "_{:02x}", byte);
                }
            }
        }
        escaped
    }
}

impl Default for SessionNaming {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_PREFIX)
    }
}
