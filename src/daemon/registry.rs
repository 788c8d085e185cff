//! In-memory table of agent sessions, keyed by OS pid.
//!
//! The registry also owns the pending correlations: a spawn call parks a
//! oneshot resolver here, keyed by the child's pid, and the child's later
//! report-back resolves it. Both maps live in one struct so every mutation
//! (spawn, report, stop, prune, exit) goes through one set of methods.

use crate::daemon::process::{ProcessControl, StopSignal};
use crate::daemon_log::daemon_log;
use crate::rpc::{DaemonError, DaemonResult, ReportOutcome, SessionMetadata, SessionSummary, StartedBy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;

/// Prefix for synthetic `PID-<n>` session identifiers.
const PID_ID_PREFIX: &str = "PID-";

/// Handle to a plain child process launched by the daemon.
///
/// The child itself is owned by its exit watcher task, which keeps it
/// unreaped (so its pid can't be recycled) until it actually exits.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl ChildHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct TrackedSession {
    pub pid: u32,
    pub started_by: StartedBy,
    pub tmux_session_id: Option<String>,
    pub session_id: Option<String>,
    /// Only for daemon-started, non-multiplexed sessions.
    pub child: Option<ChildHandle>,
    pub directory_created: bool,
    pub message: Option<String>,
    pub metadata: Option<SessionMetadata>,
}

impl TrackedSession {
    pub fn daemon_spawned(pid: u32) -> Self {
        Self {
            pid,
            started_by: StartedBy::Daemon,
            tmux_session_id: None,
            session_id: None,
            child: None,
            directory_created: false,
            message: None,
            metadata: None,
        }
    }

    pub fn external(pid: u32, session_id: String, metadata: SessionMetadata) -> Self {
        Self {
            pid,
            started_by: StartedBy::External,
            tmux_session_id: None,
            session_id: Some(session_id),
            child: None,
            directory_created: false,
            message: None,
            metadata: Some(metadata),
        }
    }

    fn summary(&self, awaiting_report: bool) -> SessionSummary {
        SessionSummary {
            pid: self.pid,
            started_by: self.started_by,
            session_id: self.session_id.clone(),
            tmux_session_id: self.tmux_session_id.clone(),
            directory_created: self.directory_created,
            message: self.message.clone(),
            awaiting_report,
            metadata: self.metadata.clone(),
        }
    }
}

/// A spawn call waiting for its child to report a session id.
struct PendingCorrelation {
    resolver: oneshot::Sender<String>,
    deadline: Instant,
}

pub struct SessionRegistry {
    sessions: HashMap<u32, TrackedSession>,
    pending: HashMap<u32, PendingCorrelation>,
    process: Arc<dyn ProcessControl>,
}

impl SessionRegistry {
    pub fn new(process: Arc<dyn ProcessControl>) -> Self {
        Self {
            sessions: HashMap::new(),
            pending: HashMap::new(),
            process,
        }
    }

    pub fn shared(process: Arc<dyn ProcessControl>) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(process)))
    }

    /// Inserts or replaces the entry for `session.pid`.
    pub fn upsert(&mut self, session: TrackedSession) -> Option<TrackedSession> {
        self.sessions.insert(session.pid, session)
    }

    pub fn get(&self, pid: u32) -> Option<&TrackedSession> {
        self.sessions.get(&pid)
    }

    /// Removes the entry and any pending correlation for it. Dropping the
    /// resolver wakes the waiting spawn call with a closed-channel error.
    pub fn remove(&mut self, pid: u32) -> Option<TrackedSession> {
        self.pending.remove(&pid);
        self.sessions.remove(&pid)
    }

    pub fn all(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|s| s.summary(self.pending.contains_key(&s.pid)))
            .collect();
        list.sort_by_key(|s| s.pid);
        list
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn has_pending(&self, pid: u32) -> bool {
        self.pending.contains_key(&pid)
    }

    /// Parks a resolver for `pid` until `deadline`.
    ///
    /// At most one correlation may exist per pid.
    pub fn register_pending(
        &mut self,
        pid: u32,
        deadline: Instant,
    ) -> DaemonResult<oneshot::Receiver<String>> {
        if self.pending.contains_key(&pid) {
            return Err(DaemonError::Internal {
                message: format!("pid {} already has a pending correlation", pid),
            });
        }
        let (resolver, receiver) = oneshot::channel();
        self.pending
            .insert(pid, PendingCorrelation { resolver, deadline });
        Ok(receiver)
    }

    /// Cancels the correlation for `pid` after its deadline passed.
    ///
    /// The child keeps running. If it has not reported yet, its entry is
    /// demoted to externally tracked so a late report can still adopt it.
    /// Returns true if a correlation was cancelled.
    pub fn expire_correlation(&mut self, pid: u32) -> bool {
        let cancelled = self.pending.remove(&pid).is_some();
        if let Some(entry) = self.sessions.get_mut(&pid) {
            if entry.session_id.is_none() {
                entry.started_by = StartedBy::External;
                entry.child = None;
                entry.message = Some("Session did not report within the spawn timeout".to_string());
            }
        }
        cancelled
    }

    /// Cancels every correlation whose deadline is at or before `now`.
    ///
    /// Spawn calls normally expire their own correlation; this sweep covers
    /// callers that went away (dropped connection) before their deadline.
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<u32> {
        let overdue: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &overdue {
            self.expire_correlation(*pid);
        }
        overdue
    }

    /// Drops every resolver; waiting spawn calls wake with an error.
    pub fn cancel_all_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Report-back from an agent process.
    ///
    /// Resolves the pending spawn for `metadata.host_pid` if there is one,
    /// attaches the identity to a known entry, or adopts an unknown pid as
    /// an externally started session. Already-correlated pids are ignored.
    pub fn report_from_child(
        &mut self,
        session_id: String,
        metadata: SessionMetadata,
    ) -> DaemonResult<ReportOutcome> {
        let pid = metadata.host_pid;
        if pid == 0 {
            return Err(DaemonError::InvalidReport {
                message: "metadata.host_pid is missing".to_string(),
            });
        }
        if session_id.trim().is_empty() {
            return Err(DaemonError::InvalidReport {
                message: "session id is empty".to_string(),
            });
        }

        let Some(entry) = self.sessions.get_mut(&pid) else {
            daemon_log(
                "registry",
                &format!("Adopting externally started session {} (pid {})", session_id, pid),
            );
            self.sessions
                .insert(pid, TrackedSession::external(pid, session_id, metadata));
            return Ok(ReportOutcome::Adopted);
        };

        if let Some(existing) = &entry.session_id {
            if *existing != session_id {
                tracing::warn!(
                    "pid {} reported session {} but is already correlated with {}",
                    pid,
                    session_id,
                    existing
                );
            }
            return Ok(ReportOutcome::Ignored);
        }

        entry.session_id = Some(session_id.clone());
        entry.metadata = Some(metadata);
        entry.message = None;

        match self.pending.remove(&pid) {
            Some(pending) if pending.resolver.send(session_id).is_ok() => {
                Ok(ReportOutcome::ResolvedPending)
            }
            _ => Ok(ReportOutcome::Updated),
        }
    }

    /// Resolves `id` (pid, `PID-<n>`, or session id) to a tracked pid.
    pub fn find(&self, id: &str) -> Option<u32> {
        let id = id.trim();
        let numeric = id.strip_prefix(PID_ID_PREFIX).unwrap_or(id);
        if let Ok(pid) = numeric.parse::<u32>() {
            if self.sessions.contains_key(&pid) {
                return Some(pid);
            }
        }
        self.sessions
            .values()
            .find(|s| s.session_id.as_deref() == Some(id))
            .map(|s| s.pid)
    }

    /// Stops a session. Unknown ids return false and change nothing.
    ///
    /// Signal delivery is best-effort: the entry is removed whether or not
    /// the process could be signalled.
    pub fn stop(&mut self, id: &str) -> bool {
        let Some(pid) = self.find(id) else {
            return false;
        };
        let Some(entry) = self.remove(pid) else {
            return false;
        };

        // A reaped child's pid may already belong to another process.
        if entry.child.as_ref().is_some_and(ChildHandle::has_exited) {
            daemon_log(
                "registry",
                &format!("Session pid {} already exited, nothing to signal", pid),
            );
            return true;
        }
        let target = entry.pid;
        if let Err(e) = self.process.signal(target, StopSignal::Terminate) {
            daemon_log(
                "registry",
                &format!("Stop of pid {} could not be delivered: {:#}", target, e),
            );
        } else {
            daemon_log("registry", &format!("Sent SIGTERM to session pid {}", target));
        }
        true
    }

    /// Removes entries whose process no longer exists.
    pub fn prune_dead(&mut self) -> Vec<u32> {
        let dead: Vec<u32> = self
            .sessions
            .values()
            .filter(|s| {
                s.child.as_ref().is_some_and(ChildHandle::has_exited)
                    || !self.process.is_alive(s.pid)
            })
            .map(|s| s.pid)
            .collect();
        for pid in &dead {
            self.remove(*pid);
        }
        dead
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
