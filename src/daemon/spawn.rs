//! Spawn orchestration: directory, environment, launch, correlation.
//!
//! A spawn call does not learn the session id from the launch itself. The
//! agent assigns its own id and reports it back over the control surface,
//! keyed by its pid. The call parks a resolver in the registry and waits for
//! that report or for the correlation deadline, whichever comes first. Other
//! requests keep being served while it waits.

use crate::agent::{
    AgentKind, ENV_DAEMON_PORT, ENV_MACHINE_ID, ENV_SESSION_ID, ENV_STARTED_BY, STARTED_BY_DAEMON,
};
use crate::config::AgentCommands;
use crate::daemon::credentials::CredentialStore;
use crate::daemon::directory::{resolve_directory, DirectoryResolution};
use crate::daemon::env::{preflight_check, profile_layer, resolve_environment, EnvMap};
use crate::daemon::profiles::ProfileSource;
use crate::daemon::registry::{ChildHandle, SharedRegistry, TrackedSession};
use crate::daemon::tmux::{Multiplexer, TmuxLaunch, TmuxTarget};
use crate::daemon_log::daemon_log;
use crate::rpc::{SpawnRequest, SpawnResult, StartedBy};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

const EXITED_BEFORE_REPORT: &str = "Session process exited before reporting its session id";

/// A plain (non-multiplexed) agent launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added on top of the inherited daemon environment.
    pub env: EnvMap,
}

/// A started child: its pid and a future that completes when it exits.
pub struct LaunchedChild {
    pub pid: u32,
    pub exited: BoxFuture<'static, ()>,
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, launch: &PlainLaunch) -> Result<LaunchedChild>;
}

/// Starts agents as detached processes in their own process group, so
/// they outlive the daemon and don't receive its terminal signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl ProcessLauncher for DetachedLauncher {
    fn launch(&self, launch: &PlainLaunch) -> Result<LaunchedChild> {
        let mut cmd = tokio::process::Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(&launch.cwd)
            .envs(&launch.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", launch.program))?;
        let pid = child.id().context("Spawned process has no pid")?;
        Ok(LaunchedChild {
            pid,
            exited: Box::pin(async move {
                let _ = child.wait().await;
            }),
        })
    }
}

/// Static spawn settings.
#[derive(Debug, Clone)]
pub struct SpawnSettings {
    pub agents: AgentCommands,
    pub correlation_timeout: Duration,
    /// Control port announced to agents for their report-back.
    pub daemon_port: u16,
    /// `sessiond` binary used to wrap agents that report back through
    /// `sessiond agent`. Without it agents run unwrapped.
    pub launcher: Option<PathBuf>,
}

pub struct SpawnOrchestrator {
    registry: SharedRegistry,
    profiles: Arc<dyn ProfileSource>,
    credentials: CredentialStore,
    multiplexer: Arc<dyn Multiplexer>,
    launcher: Arc<dyn ProcessLauncher>,
    /// Snapshot of the daemon's own environment: the expansion source and
    /// the base of the explicit multiplexer environment.
    daemon_env: Arc<EnvMap>,
    settings: SpawnSettings,
}

/// How a freshly launched pid entered the registry.
enum Tracking {
    Pending(oneshot::Receiver<String>),
    /// The child reported before it was recorded.
    AlreadyReported(String),
    /// The child exited before it was recorded.
    Exited,
}

struct Launched {
    pid: u32,
    tmux_session_id: Option<String>,
    child: Option<ChildHandle>,
}

impl SpawnOrchestrator {
    pub fn new(
        registry: SharedRegistry,
        profiles: Arc<dyn ProfileSource>,
        credentials: CredentialStore,
        multiplexer: Arc<dyn Multiplexer>,
        launcher: Arc<dyn ProcessLauncher>,
        daemon_env: EnvMap,
        settings: SpawnSettings,
    ) -> Self {
        Self {
            registry,
            profiles,
            credentials,
            multiplexer,
            launcher,
            daemon_env: Arc::new(daemon_env),
            settings,
        }
    }

    /// Runs one spawn request to completion. Every failure becomes a single
    /// `SpawnResult::Error` message.
    pub async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
        let directory = expand_home(&request.directory);
        daemon_log(
            "spawn",
            &format!("Spawn {} in {}", request.agent, directory.display()),
        );

        // Directory creation, credential files and the settings read all
        // touch the filesystem; keep them off the async workers.
        let check_dir = directory.clone();
        let approved = request.approved_new_directory_creation;
        let resolution =
            tokio::task::spawn_blocking(move || resolve_directory(&check_dir, approved)).await;
        let directory_created = match resolution {
            Ok(Ok(DirectoryResolution::Ready { created })) => created,
            Ok(Ok(DirectoryResolution::NeedsApproval)) => {
                return SpawnResult::RequestToApproveDirectoryCreation { directory };
            }
            Ok(Err(e)) => return SpawnResult::error(e.to_string()),
            Err(e) => return SpawnResult::error(format!("Directory check failed: {}", e)),
        };

        let env = match self.resolve_env(&request).await {
            Ok(env) => env,
            Err(message) => {
                daemon_log("spawn", &format!("Refusing spawn: {}", message));
                return SpawnResult::error(message);
            }
        };

        let launched = match self.launch(request.agent, &directory, &env).await {
            Ok(launched) => launched,
            Err(e) => return SpawnResult::error(format!("{:#}", e)),
        };
        let pid = launched.pid;

        let deadline = Instant::now() + self.settings.correlation_timeout;
        let rx = match self.track(launched, directory_created, deadline).await {
            Ok(Tracking::AlreadyReported(session_id)) => {
                return SpawnResult::Success { session_id };
            }
            Ok(Tracking::Pending(rx)) => rx,
            Ok(Tracking::Exited) => return SpawnResult::error(EXITED_BEFORE_REPORT),
            Err(e) => return SpawnResult::error(e.to_string()),
        };

        self.await_report(pid, rx, deadline).await
    }

    async fn resolve_env(&self, request: &SpawnRequest) -> Result<EnvMap, String> {
        let profiles = self.profiles.clone();
        let credentials = self.credentials.clone();
        let daemon_env = self.daemon_env.clone();
        let request = request.clone();
        let layered = tokio::task::spawn_blocking(move || {
            let profile = profile_layer(
                request.agent,
                request.environment_variables.as_ref(),
                profiles.as_ref(),
            );
            let auth = credentials
                .auth_env(request.agent, request.token.as_deref())
                .map_err(|e| format!("Failed to prepare credentials: {:#}", e))?;
            Ok::<_, String>((
                request,
                resolve_environment(profile, auth, |name| daemon_env.get(name).cloned()),
            ))
        })
        .await
        .map_err(|e| format!("Environment resolution failed: {}", e))?;
        let (request, mut env) = layered?;
        preflight_check(request.agent, &env).map_err(|e| e.to_string())?;

        env.insert(ENV_DAEMON_PORT.to_string(), self.settings.daemon_port.to_string());
        env.insert(ENV_STARTED_BY.to_string(), STARTED_BY_DAEMON.to_string());
        env.insert(ENV_MACHINE_ID.to_string(), request.machine_id.clone());
        if let Some(session_id) = &request.session_id {
            env.insert(ENV_SESSION_ID.to_string(), session_id.clone());
        }
        Ok(env)
    }

    /// Full command line for `agent`, wrapped in `sessiond agent` when the
    /// agent relies on it for the report-back.
    fn agent_command(&self, agent: AgentKind) -> Vec<String> {
        let invocation = self.settings.agents.get(agent);
        let mut command = Vec::new();
        if let Some(launcher) = self.settings.launcher.as_ref().filter(|_| invocation.report_back) {
            command.push(launcher.display().to_string());
            command.push("agent".to_string());
            command.push(agent.to_string());
            command.push("--".to_string());
        }
        command.push(invocation.command.clone());
        command.extend(invocation.args.iter().cloned());
        command
    }

    /// Tries the multiplexer when requested and available, else a plain
    /// detached process.
    async fn launch(&self, agent: AgentKind, cwd: &Path, env: &EnvMap) -> Result<Launched> {
        let command = self.agent_command(agent);

        if let Some(target) = TmuxTarget::from_env(env) {
            if self.multiplexer.is_available().await {
                if let Some(launched) = self.launch_in_tmux(agent, target, cwd, env, &command).await
                {
                    return Ok(launched);
                }
            } else {
                daemon_log("spawn", "tmux requested but not available, launching directly");
            }
        }

        let (program, args) = command
            .split_first()
            .context("Agent command is empty")?;
        let child = self.launcher.launch(&PlainLaunch {
            program: program.clone(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
            env: env.clone(),
        })?;
        let handle = ChildHandle::new(child.pid);
        self.watch_exit(handle.clone(), child.exited);
        daemon_log("spawn", &format!("Started {} as pid {}", agent, child.pid));
        Ok(Launched {
            pid: child.pid,
            tmux_session_id: None,
            child: Some(handle),
        })
    }

    async fn launch_in_tmux(
        &self,
        agent: AgentKind,
        target: TmuxTarget,
        cwd: &Path,
        env: &EnvMap,
        command: &[String],
    ) -> Option<Launched> {
        // tmux does not inherit our environment; hand it everything.
        let mut full_env = (*self.daemon_env).clone();
        full_env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let launch = TmuxLaunch {
            session: target,
            window_name: format!("{}-{}", agent, chrono::Utc::now().timestamp_millis()),
            cwd: cwd.to_path_buf(),
            command: command.to_vec(),
        };
        let result = self.multiplexer.spawn_in_tmux(&launch, &full_env).await;
        match (result.success, result.pid) {
            (true, Some(pid)) => {
                daemon_log(
                    "spawn",
                    &format!(
                        "Started {} in tmux {} as pid {}",
                        agent,
                        result.session_id.as_deref().unwrap_or("?"),
                        pid
                    ),
                );
                Some(Launched {
                    pid,
                    tmux_session_id: result.session_id,
                    child: None,
                })
            }
            _ => {
                daemon_log(
                    "spawn",
                    &format!(
                        "tmux launch failed, falling back to a plain process: {}",
                        result.error.as_deref().unwrap_or("no pid reported")
                    ),
                );
                None
            }
        }
    }

    /// Forgets a plain child once it exits. Removing the entry also drops
    /// its pending resolver, which wakes the spawn call.
    fn watch_exit(&self, handle: ChildHandle, exited: BoxFuture<'static, ()>) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            exited.await;
            handle.mark_exited();
            let mut registry = registry.lock().await;
            let owned = registry
                .get(handle.pid())
                .is_some_and(|s| s.child.is_some());
            if owned {
                registry.remove(handle.pid());
                daemon_log("spawn", &format!("Session pid {} exited", handle.pid()));
            }
        });
    }

    async fn track(
        &self,
        launched: Launched,
        directory_created: bool,
        deadline: Instant,
    ) -> crate::rpc::DaemonResult<Tracking> {
        let mut registry = self.registry.lock().await;
        let pid = launched.pid;

        let mut session = TrackedSession::daemon_spawned(pid);
        session.tmux_session_id = launched.tmux_session_id;
        session.child = launched.child;
        session.directory_created = directory_created;

        // A fast child may already have reported and been adopted. An entry
        // that did not come from a daemon launch is a stale one on a
        // recycled pid and is replaced.
        if let Some(existing) = registry.get(pid) {
            let from_daemon_launch = existing
                .metadata
                .as_ref()
                .and_then(|m| m.started_by.as_deref())
                == Some(STARTED_BY_DAEMON);
            if let Some(session_id) = existing.session_id.clone().filter(|_| from_daemon_launch) {
                session.session_id = Some(session_id.clone());
                session.metadata = existing.metadata.clone();
                registry.upsert(session);
                return Ok(Tracking::AlreadyReported(session_id));
            }
        }

        if session.child.as_ref().is_some_and(ChildHandle::has_exited) {
            return Ok(Tracking::Exited);
        }

        registry.upsert(session);
        registry.register_pending(pid, deadline).map(Tracking::Pending)
    }

    async fn await_report(
        &self,
        pid: u32,
        mut rx: oneshot::Receiver<String>,
        deadline: Instant,
    ) -> SpawnResult {
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(session_id)) => {
                daemon_log("spawn", &format!("pid {} reported session {}", pid, session_id));
                SpawnResult::Success { session_id }
            }
            Ok(Err(_)) => {
                let registry = self.registry.lock().await;
                match registry.get(pid) {
                    Some(_) => SpawnResult::error("Spawn was cancelled before the session reported its id"),
                    None => SpawnResult::error(EXITED_BEFORE_REPORT),
                }
            }
            Err(_) => {
                let mut registry = self.registry.lock().await;
                registry.expire_correlation(pid);
                // A report may have landed between the deadline and the lock.
                if let Ok(session_id) = rx.try_recv() {
                    return SpawnResult::Success { session_id };
                }
                let still_tracked = registry
                    .get(pid)
                    .is_some_and(|s| s.started_by == StartedBy::External);
                daemon_log(
                    "spawn",
                    &format!(
                        "pid {} did not report within {}ms (still tracked: {})",
                        pid,
                        self.settings.correlation_timeout.as_millis(),
                        still_tracked
                    ),
                );
                SpawnResult::error(format!(
                    "Session did not report its id within {} seconds. The process (pid {}) keeps running and will be tracked if it reports later.",
                    self.settings.correlation_timeout.as_secs(),
                    pid
                ))
            }
        }
    }
}

/// Expands a leading `~` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
#[path = "tests/spawn_tests.rs"]
mod tests;
