//! Test doubles for the daemon's OS and collaborator seams.

use crate::daemon::health::RestartSpawner;
use crate::daemon::process::{ProcessControl, StopSignal};
use crate::daemon::profiles::{Profile, ProfileSource};
use crate::daemon::spawn::{LaunchedChild, PlainLaunch, ProcessLauncher};
use crate::daemon::tmux::{Multiplexer, TmuxLaunch, TmuxLaunchResult};
use crate::daemon::upstream::{DaemonStatus, UpstreamSync};
use crate::version::VersionSource;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Fixed active profile.
pub struct StaticProfiles(pub Option<Profile>);

impl ProfileSource for StaticProfiles {
    fn active_profile(&self) -> Option<Profile> {
        self.0.clone()
    }
}

/// In-memory process table.
pub struct FakeProcess {
    pid: u32,
    alive: Mutex<HashSet<u32>>,
    pub signals: Mutex<Vec<(u32, StopSignal)>>,
    pub exits: Mutex<Vec<i32>>,
    /// Signalled pids die immediately when set.
    pub signal_kills: bool,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Self {
        let mut alive = HashSet::new();
        alive.insert(pid);
        Self {
            pid,
            alive: Mutex::new(alive),
            signals: Mutex::new(Vec::new()),
            exits: Mutex::new(Vec::new()),
            signal_kills: true,
        }
    }

    pub fn spawn_pid(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn kill_pid(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }

    pub fn signals(&self) -> Vec<(u32, StopSignal)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn exits(&self) -> Vec<i32> {
        self.exits.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeProcess {
    fn self_pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        self.signals.lock().unwrap().push((pid, signal));
        let existed = if self.signal_kills {
            self.alive.lock().unwrap().remove(&pid)
        } else {
            self.is_alive(pid)
        };
        if !existed {
            anyhow::bail!("no such process {}", pid);
        }
        Ok(())
    }

    fn exit(&self, code: i32) {
        self.exits.lock().unwrap().push(code);
    }
}

/// Multiplexer that records launches instead of running tmux.
pub struct FakeMultiplexer {
    pub available: bool,
    pub fail_with: Option<String>,
    pub leaf_pid: u32,
    pub launches: Mutex<Vec<(TmuxLaunch, BTreeMap<String, String>)>>,
}

impl FakeMultiplexer {
    pub fn new(available: bool, leaf_pid: u32) -> Self {
        Self {
            available,
            fail_with: None,
            leaf_pid,
            launches: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn spawn_in_tmux(
        &self,
        launch: &TmuxLaunch,
        env: &BTreeMap<String, String>,
    ) -> TmuxLaunchResult {
        self.launches
            .lock()
            .unwrap()
            .push((launch.clone(), env.clone()));
        match &self.fail_with {
            Some(error) => TmuxLaunchResult::failed(error.clone()),
            None => TmuxLaunchResult {
                success: true,
                session_id: Some(format!(
                    "{}:{}",
                    launch.session.name_or("agents"),
                    launch.window_name
                )),
                pid: Some(self.leaf_pid),
                error: None,
            },
        }
    }
}

/// Launcher handing out sequential pids; children "exit" on request.
pub struct FakeLauncher {
    next_pid: AtomicU32,
    pub fail_with: Option<String>,
    pub launches: Mutex<Vec<PlainLaunch>>,
    exits: Mutex<HashMap<u32, tokio::sync::oneshot::Sender<()>>>,
}

impl FakeLauncher {
    pub fn new(first_pid: u32) -> Self {
        Self {
            next_pid: AtomicU32::new(first_pid),
            fail_with: None,
            launches: Mutex::new(Vec::new()),
            exits: Mutex::new(HashMap::new()),
        }
    }

    pub fn launches(&self) -> Vec<PlainLaunch> {
        self.launches.lock().unwrap().clone()
    }

    /// Makes child `pid` exit.
    pub fn exit_child(&self, pid: u32) {
        if let Some(tx) = self.exits.lock().unwrap().remove(&pid) {
            let _ = tx.send(());
        }
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, launch: &PlainLaunch) -> Result<LaunchedChild> {
        if let Some(error) = &self.fail_with {
            anyhow::bail!("{}", error);
        }
        self.launches.lock().unwrap().push(launch.clone());
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.exits.lock().unwrap().insert(pid, tx);
        Ok(LaunchedChild {
            pid,
            exited: Box::pin(async move {
                let _ = rx.await;
            }),
        })
    }
}

/// Upstream sink recording pushes; optionally slow to exercise the bound.
#[derive(Default)]
pub struct RecordingUpstream {
    pub pushes: Mutex<Vec<DaemonStatus>>,
    pub delay: Option<Duration>,
}

#[async_trait::async_trait]
impl UpstreamSync for RecordingUpstream {
    async fn push_status(&self, status: DaemonStatus) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.pushes.lock().unwrap().push(status);
        Ok(())
    }
}

/// Installed version with a settable answer.
pub struct FakeVersionSource {
    pub version: Mutex<String>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeVersionSource {
    pub fn new(version: &str) -> Self {
        Self {
            version: Mutex::new(version.to_string()),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, version: &str) {
        *self.version.lock().unwrap() = version.to_string();
    }
}

impl VersionSource for FakeVersionSource {
    fn installed_version(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("version lookup failed");
        }
        Ok(self.version.lock().unwrap().clone())
    }
}

/// Replacement spawner that only counts.
#[derive(Default)]
pub struct FakeRestart {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl RestartSpawner for FakeRestart {
    fn spawn_replacement(&self) -> Result<u32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("exec failed");
        }
        Ok(99_999)
    }
}
