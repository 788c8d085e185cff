//! Control client for the running daemon, plus detached daemon launch.
//!
//! The daemon's port comes from the heartbeat snapshot. Connections are
//! retried with jittered exponential backoff, since a freshly started daemon
//! may have written its heartbeat a moment before it accepts connections.

use crate::daemon::process::{ProcessControl, StopSignal};
use crate::daemon::state_store::{DaemonPersistedState, StateStore};
use crate::daemon_log::daemon_log;
use crate::paths::{DaemonPaths, SESSIOND_HOME_ENV};
use crate::rpc::control_service::ControlServiceClient;
use crate::rpc::{
    DaemonInfo, ReportOutcome, SessionMetadata, SessionSummary, ShutdownOrigin, SpawnRequest,
    SpawnResult,
};
use crate::version::daemon_executable;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tarpc::client;
use tarpc::tokio_serde::formats::Bincode;

/// Maximum connection attempts with exponential backoff.
const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;

/// Headroom on top of the correlation timeout for spawn calls.
const SPAWN_DEADLINE_MARGIN: Duration = Duration::from_secs(10);

/// How often `stop_daemon` re-checks the old pid.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ControlClient {
    client: ControlServiceClient,
}

impl ControlClient {
    /// Single connection attempt to `127.0.0.1:<port>`.
    pub async fn connect(port: u16) -> Result<Self> {
        use tarpc::serde_transport::tcp;

        let addr = format!("127.0.0.1:{}", port);
        let transport = tcp::connect(&addr, Bincode::default)
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", addr))?;
        let client = ControlServiceClient::new(client::Config::default(), transport).spawn();
        Ok(Self { client })
    }

    /// Connect with retry and exponential backoff.
    pub async fn connect_with_retry(port: u16) -> Result<Self> {
        let mut delay_ms = BASE_DELAY_MS;

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match Self::connect(port).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt == MAX_CONNECT_ATTEMPTS => {
                    return Err(e.context(format!(
                        "Failed to connect after {} attempts",
                        MAX_CONNECT_ATTEMPTS
                    )))
                }
                Err(_) => {}
            }

            // Add jitter (±25%)
            let jitter = (delay_ms as f64 * 0.25 * (rand::random::<f64>() * 2.0 - 1.0)) as i64;
            let actual_delay = (delay_ms as i64 + jitter).max(10) as u64;
            tokio::time::sleep(Duration::from_millis(actual_delay)).await;
            delay_ms *= 2;
        }

        anyhow::bail!("Failed to connect after {} attempts", MAX_CONNECT_ATTEMPTS)
    }

    /// Connects to the daemon recorded in the heartbeat snapshot.
    pub async fn from_state(paths: &DaemonPaths) -> Result<Self> {
        let state = StateStore::new(paths.state_path())
            .read()
            .context("Daemon is not running (no heartbeat snapshot)")?;
        Self::connect_with_retry(state.http_port).await
    }

    /// Spawn calls block until the agent reports back, so the default
    /// tarpc deadline is too short for them.
    pub async fn spawn_session(
        &self,
        request: SpawnRequest,
        correlation_timeout: Duration,
    ) -> Result<SpawnResult> {
        let mut ctx = tarpc::context::current();
        ctx.deadline = std::time::Instant::now() + correlation_timeout + SPAWN_DEADLINE_MARGIN;
        Ok(self.client.spawn_session(ctx, request).await?)
    }

    pub async fn stop_session(&self, id: &str) -> Result<bool> {
        Ok(self
            .client
            .stop_session(tarpc::context::current(), id.to_string())
            .await?)
    }

    pub async fn request_shutdown(&self, origin: ShutdownOrigin) -> Result<()> {
        match self
            .client
            .request_shutdown(tarpc::context::current(), origin)
            .await?
        {
            Ok(()) => Ok(()),
            Err(e) => anyhow::bail!("Daemon error: {}", e),
        }
    }

    pub async fn report_session(
        &self,
        session_id: &str,
        metadata: SessionMetadata,
    ) -> Result<ReportOutcome> {
        match self
            .client
            .report_session(tarpc::context::current(), session_id.to_string(), metadata)
            .await?
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => anyhow::bail!("Daemon error: {}", e),
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self.client.list_sessions(tarpc::context::current()).await?)
    }

    pub async fn status(&self) -> Result<DaemonInfo> {
        Ok(self.client.status(tarpc::context::current()).await?)
    }
}

/// Starts `sessiond run` detached, pointed at the same home directory.
///
/// Returns the new process id. The caller does not wait for it.
pub fn spawn_daemon_detached(paths: &DaemonPaths) -> Result<u32> {
    let exe = daemon_executable()
        .ok()
        .filter(|exe| exe.exists())
        .or_else(|| which::which("sessiond").ok())
        .context("Failed to find sessiond binary")?;

    let mut cmd = detached_daemon_command(&exe, paths);
    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn daemon from {}", exe.display()))?;
    daemon_log(
        "client",
        &format!("Spawned detached daemon pid {}", child.id()),
    );
    Ok(child.id())
}

fn detached_daemon_command(exe: &Path, paths: &DaemonPaths) -> std::process::Command {
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("run")
        .env(SESSIOND_HOME_ENV, paths.root())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// Waits until `pid` has written its heartbeat snapshot.
pub async fn wait_for_heartbeat(
    state_store: &StateStore,
    pid: u32,
    timeout: Duration,
) -> Result<DaemonPersistedState> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(state) = state_store.read().filter(|s| s.pid == pid) {
            return Ok(state);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "Timeout waiting for daemon pid {} to write {}",
                pid,
                state_store.path().display()
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// What `stop_daemon` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No heartbeat snapshot.
    NotRunning,
    /// The recorded pid was already gone; the snapshot was cleared.
    Stale { pid: u32 },
    /// The daemon exited after the shutdown request.
    Stopped { pid: u32 },
    /// The daemon ignored the request and was killed.
    Killed { pid: u32 },
}

/// Asks the daemon recorded in `state_store` to shut down, waits up to
/// `timeout`, then SIGKILLs it. The snapshot is cleared unless the daemon
/// already removed it on its way out.
pub async fn stop_daemon(
    state_store: &StateStore,
    process: &dyn ProcessControl,
    origin: ShutdownOrigin,
    timeout: Duration,
) -> Result<StopOutcome> {
    let Some(state) = state_store.read() else {
        return Ok(StopOutcome::NotRunning);
    };
    let pid = state.pid;

    if !process.is_alive(pid) {
        daemon_log(
            "client",
            &format!("Daemon pid {} is gone, clearing stale state", pid),
        );
        state_store.clear()?;
        return Ok(StopOutcome::Stale { pid });
    }

    match ControlClient::connect(state.http_port).await {
        Ok(client) => {
            if let Err(e) = client.request_shutdown(origin).await {
                daemon_log(
                    "client",
                    &format!("Shutdown request to pid {} failed: {:#}", pid, e),
                );
            }
        }
        Err(e) => daemon_log(
            "client",
            &format!("Could not reach daemon pid {}: {:#}", pid, e),
        ),
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !process.is_alive(pid) {
            state_store.clear_if_owned(pid)?;
            return Ok(StopOutcome::Stopped { pid });
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    if !process.is_alive(pid) {
        state_store.clear_if_owned(pid)?;
        return Ok(StopOutcome::Stopped { pid });
    }

    daemon_log(
        "client",
        &format!("Daemon pid {} did not exit in time, killing", pid),
    );
    process.signal(pid, StopSignal::Kill)?;
    state_store.clear_if_owned(pid)?;
    Ok(StopOutcome::Killed { pid })
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
