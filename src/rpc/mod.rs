//! RPC service definitions for the daemon control surface.
//!
//! This module defines the tarpc service and the wire types for:
//! - Remote control: spawn, stop and shutdown requests relayed to the daemon
//! - Report-back: spawned agents announcing their session identity
//!
//! Everything here crosses a bincode transport, so types avoid
//! `skip_serializing_if`, internal tagging and untyped JSON values.

pub mod control_service;

use crate::agent::AgentKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// SPAWN
// ============================================================================

/// One request to start an agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub directory: PathBuf,
    /// Pre-known session id, passed to the agent for resume.
    pub session_id: Option<String>,
    pub machine_id: String,
    pub approved_new_directory_creation: bool,
    pub agent: AgentKind,
    pub token: Option<String>,
    /// Explicit profile variables. `Some` (even empty) disables the local
    /// active-profile fallback.
    pub environment_variables: Option<BTreeMap<String, String>>,
}

impl SpawnRequest {
    pub fn new(directory: impl Into<PathBuf>, agent: AgentKind, machine_id: &str) -> Self {
        Self {
            directory: directory.into(),
            session_id: None,
            machine_id: machine_id.to_string(),
            approved_new_directory_creation: false,
            agent,
            token: None,
            environment_variables: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnResult {
    Success { session_id: String },
    RequestToApproveDirectoryCreation { directory: PathBuf },
    Error { message: String },
}

impl SpawnResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

// ============================================================================
// SESSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartedBy {
    Daemon,
    External,
}

/// Metadata a spawned agent reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// OS pid of the reporting agent process; the registry key.
    pub host_pid: u32,
    pub path: String,
    pub machine_id: Option<String>,
    pub agent: Option<AgentKind>,
    /// Free-form `SESSIOND_STARTED_BY` value seen by the agent.
    pub started_by: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// Read-only view of one tracked session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub pid: u32,
    pub started_by: StartedBy,
    pub session_id: Option<String>,
    pub tmux_session_id: Option<String>,
    pub directory_created: bool,
    pub message: Option<String>,
    pub awaiting_report: bool,
    pub metadata: Option<SessionMetadata>,
}

/// What a report-back did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportOutcome {
    /// A waiting spawn call received the session id.
    ResolvedPending,
    /// A known session (e.g. one whose spawn timed out) got its identity.
    Updated,
    /// Unknown pid; tracked as an externally started session.
    Adopted,
    /// Pid already correlated; duplicate or late report.
    Ignored,
}

// ============================================================================
// DAEMON
// ============================================================================

/// Who asked the daemon to shut down over the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownOrigin {
    Remote,
    Cli,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: u32,
    pub version: String,
    pub build_sha: String,
    pub start_time: String,
    pub http_port: u16,
    pub session_count: usize,
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors returned by daemon RPC methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DaemonError {
    /// Daemon is shutting down
    ShuttingDown,
    /// Report-back carried no usable pid or session id
    InvalidReport { message: String },
    /// Internal error
    Internal { message: String },
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::ShuttingDown => write!(f, "Daemon is shutting down"),
            DaemonError::InvalidReport { message } => write!(f, "Invalid report: {}", message),
            DaemonError::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for DaemonError {}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
