//! Centralized home-based storage paths for the session daemon.
//!
//! Everything lives under `~/.agent-sessiond/` (or `$SESSIOND_HOME`):
//! - `daemon.state.json` - Heartbeat snapshot for cross-process discovery
//! - `daemon.lock` - Single-instance lock sentinel
//! - `logs/` - Daemon logs, one file per daemon run
//! - `settings.json` - Profiles and the active profile selection
//! - `config.yaml` - Daemon tuning
//! - `credentials/<agent>/` - Credential files written for spawned agents

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// The name of the daemon home directory.
const SESSIOND_DIR: &str = ".agent-sessiond";

/// Environment variable overriding the home directory.
pub const SESSIOND_HOME_ENV: &str = "SESSIOND_HOME";

/// Resolved storage layout rooted at one home directory.
///
/// Passed around explicitly so tests can point a whole daemon at a tempdir
/// without touching process-global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    root: PathBuf,
}

impl DaemonPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the layout for this user: `$SESSIOND_HOME` or `~/.agent-sessiond/`.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn from_env() -> Result<Self> {
        let root = match std::env::var_os(SESSIOND_HOME_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .context("Could not determine home directory for daemon storage")?
                .join(SESSIOND_DIR),
        };
        let paths = Self::new(root);
        paths.ensure_root()?;
        Ok(paths)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create daemon directory: {}", self.root.display())
        })
    }

    /// Returns the heartbeat snapshot path: `<root>/daemon.state.json`
    pub fn state_path(&self) -> PathBuf {
        self.root.join("daemon.state.json")
    }

    /// Returns the lock sentinel path: `<root>/daemon.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("daemon.lock")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    /// Returns the logs directory: `<root>/logs/`
    ///
    /// Creates the directory if it doesn't exist.
    pub fn logs_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("logs");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
        Ok(dir)
    }

    /// Returns a fresh log path for a daemon run:
    /// `<root>/logs/daemon-<YYYYmmdd-HHMMSS>-pid-<pid>.log`
    pub fn daemon_log_path(&self, pid: u32) -> Result<PathBuf> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        Ok(self
            .logs_dir()?
            .join(format!("daemon-{}-pid-{}.log", stamp, pid)))
    }

    /// Returns the credentials root: `<root>/credentials/`
    ///
    /// Not created here; the credentials writer owns creation and permissions.
    pub fn credentials_root(&self) -> PathBuf {
        self.root.join("credentials")
    }
}
