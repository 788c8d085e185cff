//! Heartbeat snapshot persisted for cross-process discovery.
//!
//! One JSON file per machine. Writes go to a sibling temp file and are
//! renamed into place, so readers see either the old or the new snapshot,
//! never a torn one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Distinguishes temp files of concurrent writers within one process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonRunStatus {
    Running,
    ShuttingDown,
}

fn default_status() -> DaemonRunStatus {
    DaemonRunStatus::Running
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonPersistedState {
    pub pid: u32,
    pub http_port: u16,
    /// RFC 3339.
    pub start_time: String,
    pub started_with_cli_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<String>,
    pub daemon_log_path: String,
    #[serde(default = "default_status")]
    pub status: DaemonRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_requested_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_source: Option<String>,
}

impl DaemonPersistedState {
    pub fn new(pid: u32, http_port: u16, version: &str, log_path: &Path) -> Self {
        Self {
            pid,
            http_port,
            start_time: chrono::Utc::now().to_rfc3339(),
            started_with_cli_version: version.to_string(),
            last_heartbeat: None,
            daemon_log_path: log_path.display().to_string(),
            status: DaemonRunStatus::Running,
            shutdown_requested_at: None,
            shutdown_source: None,
        }
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn mark_shutting_down(&mut self, source: &str) {
        self.status = DaemonRunStatus::ShuttingDown;
        self.shutdown_requested_at = Some(chrono::Utc::now().to_rfc3339());
        self.shutdown_source = Some(source.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists the full snapshot atomically.
    pub fn write(&self, state: &DaemonPersistedState) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("State file path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize daemon state")?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "daemon.state.json".to_string());
        let tmp_path = dir.join(format!(
            ".{}.tmp-{}-{}",
            file_name,
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let mut tmp = std::fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write daemon state")?;
        tmp.sync_all().context("Failed to sync daemon state")?;
        drop(tmp);

        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).with_context(|| {
                format!("Failed to move daemon state into {}", self.path.display())
            });
        }
        Ok(())
    }

    /// Returns `None` when no daemon has written a snapshot, or the snapshot
    /// is unreadable (treated the same as absent).
    pub fn read(&self) -> Option<DaemonPersistedState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("Ignoring malformed daemon state {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// True when the snapshot on disk was written by `pid`.
    pub fn is_owned_by(&self, pid: u32) -> bool {
        self.read().is_some_and(|state| state.pid == pid)
    }

    /// Deletes the snapshot only if `pid` wrote it. Another daemon's
    /// heartbeat is left in place. Returns whether a file was removed.
    pub fn clear_if_owned(&self, pid: u32) -> Result<bool> {
        if !self.is_owned_by(pid) {
            return Ok(false);
        }
        self.clear()?;
        Ok(true)
    }

    /// Deletes the snapshot. Missing file is fine.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove {}", self.path.display()))
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/state_store_tests.rs"]
mod tests;
