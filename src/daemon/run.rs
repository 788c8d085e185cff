//! Daemon startup: predecessor handling, lock, wiring, and the wait for the
//! first shutdown trigger.

use crate::client::{spawn_daemon_detached, stop_daemon, StopOutcome};
use crate::config::DaemonConfig;
use crate::daemon::control::{
    find_available_port, run_control_server, ControlServer, DaemonIdentity,
};
use crate::daemon::credentials::CredentialStore;
use crate::daemon::health::{HealthMonitor, RestartSpawner, TickCounters};
use crate::daemon::lifecycle::{Lifecycle, ShutdownSource, Teardown};
use crate::daemon::lock::LockManager;
use crate::daemon::process::{ProcessControl, SystemProcess};
use crate::daemon::profiles::SettingsFileProfiles;
use crate::daemon::registry::SessionRegistry;
use crate::daemon::spawn::{DetachedLauncher, SpawnOrchestrator, SpawnSettings};
use crate::daemon::state_store::{DaemonPersistedState, StateStore};
use crate::daemon::tmux::TmuxCli;
use crate::daemon::upstream::{push_bounded, DaemonStatus, LogOnlyUpstream};
use crate::daemon_log::{daemon_log, init_daemon_log};
use crate::paths::DaemonPaths;
use crate::rpc::ShutdownOrigin;
use crate::version::{daemon_executable, ExecutableVersionSource, CLI_VERSION};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};

/// Self-restart launches `sessiond run` against the same home.
struct DetachedRestart {
    paths: DaemonPaths,
}

impl RestartSpawner for DetachedRestart {
    fn spawn_replacement(&self) -> Result<u32> {
        spawn_daemon_detached(&self.paths)
    }
}

/// What startup should do about a daemon recorded in the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predecessor {
    /// Nothing recorded, or it is gone now.
    Clear,
    /// A daemon of our own version is already serving.
    AlreadyRunning { pid: u32 },
}

/// Stops a running daemon of a different version. One of our own version
/// is left alone and reported back.
pub async fn resolve_predecessor(
    state_store: &StateStore,
    process: &dyn ProcessControl,
    own_version: &str,
    stop_timeout: Duration,
) -> Result<Predecessor> {
    let Some(previous) = state_store.read() else {
        return Ok(Predecessor::Clear);
    };
    if previous.pid == process.self_pid() {
        return Ok(Predecessor::Clear);
    }
    if process.is_alive(previous.pid) && previous.started_with_cli_version == own_version {
        return Ok(Predecessor::AlreadyRunning { pid: previous.pid });
    }

    daemon_log(
        "run",
        &format!(
            "Replacing daemon pid {} (version {}) with version {}",
            previous.pid, previous.started_with_cli_version, own_version
        ),
    );
    let outcome = stop_daemon(state_store, process, ShutdownOrigin::Cli, stop_timeout).await?;
    if let StopOutcome::Killed { pid } = outcome {
        daemon_log("run", &format!("Previous daemon pid {} was killed", pid));
    }
    Ok(Predecessor::Clear)
}

/// Routes panics anywhere in the daemon into the shutdown path.
fn install_panic_hook(lifecycle: Arc<Lifecycle>) {
    let runtime = tokio::runtime::Handle::current();
    std::panic::set_hook(Box::new(move |info| {
        daemon_log("run", &format!("Uncaught panic: {}", info));
        let _guard = runtime.enter();
        lifecycle.request_shutdown(ShutdownSource::Exception);
    }));
}

#[cfg(unix)]
fn install_signal_handlers(lifecycle: Arc<Lifecycle>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            daemon_log("run", &format!("Received {}", name));
            lifecycle.request_shutdown(ShutdownSource::OsSignal);
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(lifecycle: Arc<Lifecycle>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            lifecycle.request_shutdown(ShutdownSource::OsSignal);
        }
    });
    Ok(())
}

/// Runs the daemon in the foreground until it shuts down.
///
/// Returns early with `Ok` when another daemon owns this home. Otherwise
/// the teardown ends the process and this never returns normally.
pub async fn run_daemon(paths: DaemonPaths) -> Result<()> {
    let config = DaemonConfig::load(&paths.config_path())?;
    let process: Arc<dyn ProcessControl> = Arc::new(SystemProcess);
    let pid = process.self_pid();
    let log_path = paths.daemon_log_path(pid)?;
    init_daemon_log(log_path.clone());
    daemon_log(
        "run",
        &format!("Daemon {} starting (pid {})", CLI_VERSION, pid),
    );

    let state_store = StateStore::new(paths.state_path());
    let predecessor = resolve_predecessor(
        &state_store,
        process.as_ref(),
        CLI_VERSION,
        config.stop_old_daemon_timeout(),
    )
    .await?;
    if let Predecessor::AlreadyRunning { pid: other } = predecessor {
        daemon_log(
            "run",
            &format!("Daemon pid {} is already running this version, exiting", other),
        );
        return Ok(());
    }

    let lock = LockManager::new(paths.lock_path())
        .acquire(config.lock_max_retries, config.lock_retry_delay())
        .await?;
    let Some(lock) = lock else {
        daemon_log("run", "Another daemon holds the lock, exiting");
        return Ok(());
    };

    let lifecycle = Lifecycle::new(process.clone(), config.startup_shutdown_grace());
    install_panic_hook(lifecycle.clone());
    install_signal_handlers(lifecycle.clone())?;

    let (control_shutdown, _) = broadcast::channel(1);
    let mut teardown = Teardown {
        health: None,
        upstream: Arc::new(LogOnlyUpstream),
        upstream_timeout: config.upstream_push_timeout(),
        control_shutdown,
        control_task: None,
        registry: SessionRegistry::shared(process.clone()),
        state_store: state_store.clone(),
        state: None,
        lock: Some(lock),
    };

    let started = start_services(
        &paths,
        &config,
        &log_path,
        &lifecycle,
        &mut teardown,
        process.clone(),
    )
    .await;
    match started {
        Ok(()) => {
            if lifecycle.mark_running() {
                daemon_log("run", "Daemon running");
            }
        }
        Err(e) => {
            daemon_log("run", &format!("Startup failed: {:#}", e));
            lifecycle.request_shutdown(ShutdownSource::Exception);
        }
    }

    let source = lifecycle.wait_for_shutdown().await;
    if let Some(state) = teardown.state.as_mut() {
        // Teardown records the shutdown against the freshest heartbeat.
        if let Some(latest) = state_store.read().filter(|s| s.pid == pid) {
            *state = latest;
        }
    }
    lifecycle.teardown(source, teardown).await;
    Ok(())
}

/// Binds the control surface, publishes the heartbeat, and starts the
/// health loop. Whatever was started is recorded in `teardown`.
async fn start_services(
    paths: &DaemonPaths,
    config: &DaemonConfig,
    log_path: &Path,
    lifecycle: &Arc<Lifecycle>,
    teardown: &mut Teardown,
    process: Arc<dyn ProcessControl>,
) -> Result<()> {
    let pid = process.self_pid();
    let port = find_available_port().await?;

    let orchestrator = Arc::new(SpawnOrchestrator::new(
        teardown.registry.clone(),
        Arc::new(SettingsFileProfiles::new(paths.settings_path())),
        CredentialStore::new(paths.credentials_root()),
        Arc::new(TmuxCli),
        Arc::new(DetachedLauncher),
        std::env::vars().collect(),
        SpawnSettings {
            agents: config.agents.clone(),
            correlation_timeout: config.spawn_correlation_timeout(),
            daemon_port: port,
            launcher: daemon_executable().ok(),
        },
    ));

    let state = DaemonPersistedState::new(pid, port, CLI_VERSION, log_path);
    let server = ControlServer::new(
        teardown.registry.clone(),
        orchestrator,
        lifecycle.clone(),
        DaemonIdentity {
            pid,
            start_time: state.start_time.clone(),
            http_port: port,
        },
    );

    let (ready_tx, ready_rx) = oneshot::channel();
    let control_lifecycle = lifecycle.clone();
    let shutdown_tx = teardown.control_shutdown.clone();
    teardown.control_task = Some(tokio::spawn(async move {
        if let Err(e) = run_control_server(server, shutdown_tx, port, ready_tx).await {
            daemon_log("run", &format!("Control server failed: {:#}", e));
            control_lifecycle.request_shutdown(ShutdownSource::Exception);
        }
    }));
    ready_rx
        .await
        .map_err(|_| anyhow::anyhow!("Control server exited before binding port {}", port))?;

    teardown.state_store.write(&state)?;
    teardown.state = Some(state.clone());

    push_bounded(
        teardown.upstream.as_ref(),
        DaemonStatus::Running {
            pid,
            http_port: port,
        },
        config.upstream_push_timeout(),
    )
    .await;

    let monitor = Arc::new(HealthMonitor {
        registry: teardown.registry.clone(),
        state_store: teardown.state_store.clone(),
        state: Arc::new(Mutex::new(state)),
        process,
        version_source: Arc::new(ExecutableVersionSource::current()?),
        started_version: CLI_VERSION.to_string(),
        lifecycle: lifecycle.clone(),
        restart: Arc::new(DetachedRestart {
            paths: paths.clone(),
        }),
        handoff_timeout: config.restart_handoff_timeout(),
        counters: TickCounters::default(),
    });
    teardown.health = Some(monitor.spawn(config.heartbeat_interval()));
    Ok(())
}

#[cfg(test)]
#[path = "tests/run_tests.rs"]
mod tests;
