//! Daemon lifecycle and the shutdown state machine.
//!
//! Starting -> Running -> ShuttingDown -> Stopped. Any number of sources may
//! ask for shutdown; the first request wins and later ones are no-ops. The
//! teardown itself runs once, in a fixed order, and ends in process exit.

use crate::daemon::lock::DaemonLock;
use crate::daemon::process::ProcessControl;
use crate::daemon::registry::SharedRegistry;
use crate::daemon::state_store::{DaemonPersistedState, StateStore};
use crate::daemon::upstream::{push_bounded, DaemonStatus, UpstreamSync};
use crate::daemon_log::daemon_log;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// What asked the daemon to stop. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSource {
    OsSignal,
    Remote,
    Cli,
    /// Panic, failed supervised task, or other unexpected error.
    Exception,
    /// The heartbeat names another daemon pid.
    DaemonConflict,
    /// A replacement daemon was started but never stopped us.
    RestartHandoffExpired,
}

impl ShutdownSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OsSignal => "os-signal",
            Self::Remote => "remote",
            Self::Cli => "cli",
            Self::Exception => "exception",
            Self::DaemonConflict => "daemon-conflict",
            Self::RestartHandoffExpired => "restart-handoff-expired",
        }
    }
}

impl fmt::Display for ShutdownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Starting,
    Running,
    /// A replacement daemon was spawned; waiting for it to stop us.
    AwaitingExternalTermination,
    ShuttingDown,
    Stopped,
}

pub struct Lifecycle {
    phase: Mutex<LifecyclePhase>,
    trigger: watch::Sender<Option<ShutdownSource>>,
    process: Arc<dyn ProcessControl>,
    startup_grace: Duration,
}

impl Lifecycle {
    pub fn new(process: Arc<dyn ProcessControl>, startup_grace: Duration) -> Arc<Self> {
        let (trigger, _) = watch::channel(None);
        Arc::new(Self {
            phase: Mutex::new(LifecyclePhase::Starting),
            trigger,
            process,
            startup_grace,
        })
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// The first recorded shutdown request, if any.
    pub fn shutdown_source(&self) -> Option<ShutdownSource> {
        *self.trigger.borrow()
    }

    /// New spawns are refused once shutdown was requested.
    pub fn accepting_requests(&self) -> bool {
        self.shutdown_source().is_none()
            && matches!(
                self.phase(),
                LifecyclePhase::Running | LifecyclePhase::Starting
            )
    }

    /// Starting -> Running. Returns false if startup was overtaken.
    pub fn mark_running(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase == LifecyclePhase::Starting && self.shutdown_source().is_none() {
            *phase = LifecyclePhase::Running;
            true
        } else {
            false
        }
    }

    pub fn enter_awaiting_termination(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase == LifecyclePhase::Running {
            *phase = LifecyclePhase::AwaitingExternalTermination;
            true
        } else {
            false
        }
    }

    /// Back to Running after a failed self-restart attempt.
    pub fn resume_running(&self) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase == LifecyclePhase::AwaitingExternalTermination {
            *phase = LifecyclePhase::Running;
        }
    }

    /// Records a shutdown request. Returns false if one was already recorded.
    ///
    /// During startup a fallback timer is armed: if teardown has not
    /// finished when it fires, the process exits with status 1.
    pub fn request_shutdown(self: &Arc<Self>, source: ShutdownSource) -> bool {
        let mut first = false;
        self.trigger.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(source);
            first = true;
            true
        });
        if !first {
            daemon_log(
                "lifecycle",
                &format!("Shutdown already in progress, ignoring request from {}", source),
            );
            return false;
        }

        daemon_log("lifecycle", &format!("Shutdown requested by {}", source));
        if self.phase() == LifecyclePhase::Starting {
            self.arm_startup_fallback();
        }
        true
    }

    fn arm_startup_fallback(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.startup_grace).await;
            if this.phase() != LifecyclePhase::Stopped {
                daemon_log(
                    "lifecycle",
                    "Shutdown during startup did not complete in time, forcing exit(1)",
                );
                this.process.exit(1);
            }
        });
    }

    /// Resolves with the first shutdown request.
    pub async fn wait_for_shutdown(&self) -> ShutdownSource {
        let mut rx = self.trigger.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(source) = current {
                return source;
            }
            if rx.changed().await.is_err() {
                return ShutdownSource::Exception;
            }
        }
    }

    /// Runs the teardown once. Later calls return an empty step list.
    pub async fn teardown(&self, source: ShutdownSource, resources: Teardown) -> Vec<TeardownStep> {
        {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*phase, LifecyclePhase::ShuttingDown | LifecyclePhase::Stopped) {
                return Vec::new();
            }
            *phase = LifecyclePhase::ShuttingDown;
        }
        daemon_log("lifecycle", &format!("Tearing down (source: {})", source));

        let steps = resources.run(source).await;
        self.set_phase(LifecyclePhase::Stopped);
        daemon_log("lifecycle", "Daemon stopped");
        self.process.exit(0);
        steps
    }
}

/// Teardown steps, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    CancelHealth,
    PushUpstream,
    StopControlSurface,
    DeleteState,
    ReleaseLock,
}

/// Everything the teardown needs to release.
pub struct Teardown {
    pub health: Option<JoinHandle<()>>,
    pub upstream: Arc<dyn UpstreamSync>,
    pub upstream_timeout: Duration,
    pub control_shutdown: broadcast::Sender<()>,
    pub control_task: Option<JoinHandle<()>>,
    pub registry: SharedRegistry,
    pub state_store: StateStore,
    pub state: Option<DaemonPersistedState>,
    pub lock: Option<DaemonLock>,
}

impl Teardown {
    async fn run(self, source: ShutdownSource) -> Vec<TeardownStep> {
        let mut steps = Vec::new();

        if let Some(health) = self.health {
            health.abort();
        }
        steps.push(TeardownStep::CancelHealth);

        push_bounded(
            self.upstream.as_ref(),
            DaemonStatus::ShuttingDown {
                source: source.to_string(),
            },
            self.upstream_timeout,
        )
        .await;
        steps.push(TeardownStep::PushUpstream);

        let _ = self.control_shutdown.send(());
        if let Some(task) = self.control_task {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        let cancelled = self.registry.lock().await.cancel_all_pending();
        if cancelled > 0 {
            daemon_log(
                "lifecycle",
                &format!("Cancelled {} pending spawn correlations", cancelled),
            );
        }
        steps.push(TeardownStep::StopControlSurface);

        // After a lost lock race the file on disk is the winner's.
        match self.state {
            Some(mut state) if self.state_store.is_owned_by(state.pid) => {
                state.mark_shutting_down(source.as_str());
                if let Err(e) = self.state_store.write(&state) {
                    daemon_log("lifecycle", &format!("Failed to record shutdown: {:#}", e));
                }
                if let Err(e) = self.state_store.clear_if_owned(state.pid) {
                    daemon_log("lifecycle", &format!("Failed to delete state: {:#}", e));
                }
            }
            Some(state) => daemon_log(
                "lifecycle",
                &format!(
                    "Heartbeat no longer names pid {}, leaving it in place",
                    state.pid
                ),
            ),
            None => {}
        }
        steps.push(TeardownStep::DeleteState);

        if let Some(lock) = self.lock {
            if let Err(e) = lock.release() {
                daemon_log("lifecycle", &format!("Failed to release lock: {:#}", e));
            }
        }
        steps.push(TeardownStep::ReleaseLock);

        steps
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
