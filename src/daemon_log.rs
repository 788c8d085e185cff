//! Shared logging utility for daemon components.

use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Points `daemon_log` at the log file of this daemon run.
///
/// Only the first call wins; later calls are ignored so a restarted
/// component can't redirect an already-running daemon's log.
pub fn init_daemon_log(path: PathBuf) {
    let _ = LOG_PATH.set(path);
}

/// Debug logging utility for daemon components.
///
/// The `tag` parameter identifies the source module (e.g., "spawn", "health",
/// "lifecycle", "control") to aid debugging.
///
/// Writes to the daemon log recorded in the heartbeat snapshot. Before the
/// log is initialized (CLI commands, tests) lines go to stderr.
pub fn daemon_log(tag: &str, msg: &str) {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    match LOG_PATH.get() {
        Some(log_path) => {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
            {
                let _ = writeln!(file, "[{}] [{}] {}", now, tag, msg);
            }
        }
        None => eprintln!("[{}] [{}] {}", now, tag, msg),
    }
}
