//! Periodic health loop.
//!
//! Each tick prunes dead sessions, sweeps overdue correlations, checks for
//! version drift, verifies this process still owns the heartbeat, and
//! refreshes it. Ticks never overlap: a firing that arrives while the
//! previous tick still runs is dropped, not queued.

use crate::daemon::lifecycle::{Lifecycle, LifecyclePhase, ShutdownSource};
use crate::daemon::process::ProcessControl;
use crate::daemon::registry::SharedRegistry;
use crate::daemon::state_store::{DaemonPersistedState, StateStore};
use crate::daemon_log::daemon_log;
use crate::version::VersionSource;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Starts a replacement daemon for self-restart.
pub trait RestartSpawner: Send + Sync {
    /// Launches a detached daemon and returns its pid.
    fn spawn_replacement(&self) -> Result<u32>;
}

/// Timer bookkeeping; lets tests compare fired and executed ticks.
#[derive(Debug, Default)]
pub struct TickCounters {
    running: AtomicBool,
    cancelled: AtomicBool,
    pub fired: AtomicU64,
    pub executed: AtomicU64,
    pub skipped: AtomicU64,
}

impl TickCounters {
    fn try_enter(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Clears the running flag when a tick ends, even by panic or abort.
struct TickGuard<'a>(&'a TickCounters);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

pub struct HealthMonitor {
    pub registry: SharedRegistry,
    pub state_store: StateStore,
    /// This daemon's heartbeat snapshot.
    pub state: Arc<Mutex<DaemonPersistedState>>,
    pub process: Arc<dyn ProcessControl>,
    pub version_source: Arc<dyn VersionSource>,
    /// Version recorded at our own startup.
    pub started_version: String,
    pub lifecycle: Arc<Lifecycle>,
    pub restart: Arc<dyn RestartSpawner>,
    pub handoff_timeout: Duration,
    pub counters: TickCounters,
}

impl HealthMonitor {
    /// Runs the timer until cancelled. Each firing runs its tick in its own
    /// task so the timer keeps counting while a slow tick is in flight.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if self.counters.is_cancelled() {
                    break;
                }
                self.fire();
            }
            daemon_log("health", "Health timer cancelled");
        })
    }

    /// One timer firing: runs a tick unless one is still in flight.
    pub fn fire(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.counters.fired.fetch_add(1, Ordering::SeqCst);
        if !self.counters.try_enter() {
            self.counters.skipped.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = TickGuard(&this.counters);
            this.counters.executed.fetch_add(1, Ordering::SeqCst);
            this.tick().await;
        }))
    }

    pub async fn tick(&self) {
        self.prune().await;

        if self.check_version_drift().await {
            return;
        }

        if !self.owns_heartbeat() {
            return;
        }

        self.refresh_heartbeat().await;
    }

    async fn prune(&self) {
        let mut registry = self.registry.lock().await;
        let dead = registry.prune_dead();
        if !dead.is_empty() {
            daemon_log("health", &format!("Pruned dead sessions: {:?}", dead));
        }
        let expired = registry.expire_overdue(Instant::now());
        if !expired.is_empty() {
            daemon_log(
                "health",
                &format!("Expired stale spawn correlations: {:?}", expired),
            );
        }
    }

    /// Returns true when drift was handled and the tick must stop.
    async fn check_version_drift(&self) -> bool {
        let source = self.version_source.clone();
        let installed = match tokio::task::spawn_blocking(move || source.installed_version()).await
        {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                daemon_log("health", &format!("Installed version lookup failed: {:#}", e));
                return false;
            }
            Err(e) => {
                daemon_log("health", &format!("Installed version task failed: {}", e));
                return false;
            }
        };
        if installed == self.started_version {
            return false;
        }

        daemon_log(
            "health",
            &format!(
                "Installed version {} differs from running {}, restarting",
                installed, self.started_version
            ),
        );
        self.self_restart().await;
        true
    }

    /// Hands over to a fresh daemon. The replacement's startup stops us;
    /// if it never does, we shut ourselves down after the handoff timeout.
    async fn self_restart(&self) {
        if !self.lifecycle.enter_awaiting_termination() {
            return;
        }
        self.counters.cancel();

        match self.restart.spawn_replacement() {
            Ok(pid) => daemon_log("health", &format!("Spawned replacement daemon pid {}", pid)),
            Err(e) => {
                daemon_log(
                    "health",
                    &format!("Failed to spawn replacement daemon, staying up: {:#}", e),
                );
                self.counters.cancelled.store(false, Ordering::SeqCst);
                self.lifecycle.resume_running();
                return;
            }
        }

        tokio::time::sleep(self.handoff_timeout).await;
        if self.lifecycle.phase() == LifecyclePhase::AwaitingExternalTermination {
            daemon_log(
                "health",
                "Replacement daemon did not take over in time, shutting down",
            );
            self.lifecycle
                .request_shutdown(ShutdownSource::RestartHandoffExpired);
        }
    }

    /// A heartbeat naming another pid means a second daemon won the lock
    /// race; we step aside.
    fn owns_heartbeat(&self) -> bool {
        let own_pid = self.process.self_pid();
        match self.state_store.read() {
            Some(on_disk) if on_disk.pid != own_pid => {
                daemon_log(
                    "health",
                    &format!(
                        "Heartbeat belongs to pid {} (we are {}), shutting down",
                        on_disk.pid, own_pid
                    ),
                );
                self.lifecycle.request_shutdown(ShutdownSource::DaemonConflict);
                false
            }
            _ => true,
        }
    }

    async fn refresh_heartbeat(&self) {
        if self.lifecycle.phase() != LifecyclePhase::Running {
            return;
        }
        let mut state = self.state.lock().await;
        state.touch_heartbeat();
        if let Err(e) = self.state_store.write(&state) {
            daemon_log("health", &format!("Failed to refresh heartbeat: {:#}", e));
        }
    }
}

#[cfg(test)]
#[path = "tests/health_tests.rs"]
mod tests;
