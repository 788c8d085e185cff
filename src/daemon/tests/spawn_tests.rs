//! Tests for the spawn orchestrator, driven against fake launchers.

use super::*;
use crate::daemon::profiles::{AgentCompatibility, EnvVar, Profile};
use crate::daemon::registry::SessionRegistry;
use crate::daemon::testing::{FakeLauncher, FakeMultiplexer, FakeProcess, StaticProfiles};
use crate::rpc::{ReportOutcome, SessionMetadata};
use std::collections::BTreeMap;
use tempfile::TempDir;

const PORT: u16 = 4242;

struct Harness {
    orchestrator: Arc<SpawnOrchestrator>,
    registry: SharedRegistry,
    launcher: Arc<FakeLauncher>,
    tmux: Arc<FakeMultiplexer>,
    process: Arc<FakeProcess>,
    home: TempDir,
}

impl Harness {
    fn new(tmux: FakeMultiplexer, launcher: FakeLauncher, profile: Option<Profile>) -> Self {
        Self::with_settings(tmux, launcher, profile, |_| {})
    }

    fn with_settings(
        tmux: FakeMultiplexer,
        launcher: FakeLauncher,
        profile: Option<Profile>,
        adjust: impl FnOnce(&mut SpawnSettings),
    ) -> Self {
        let home = tempfile::tempdir().unwrap();
        let process = Arc::new(FakeProcess::new(1));
        let registry = SessionRegistry::shared(process.clone());
        let tmux = Arc::new(tmux);
        let launcher = Arc::new(launcher);
        let daemon_env: EnvMap = [
            ("PATH", "/usr/bin"),
            ("HOME", "/home/dev"),
            ("SHARED_SECRET", "s3cret"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut settings = SpawnSettings {
            agents: AgentCommands::default(),
            correlation_timeout: Duration::from_secs(15),
            daemon_port: PORT,
            launcher: None,
        };
        adjust(&mut settings);

        let orchestrator = Arc::new(SpawnOrchestrator::new(
            registry.clone(),
            Arc::new(StaticProfiles(profile)),
            CredentialStore::new(home.path().join("credentials")),
            tmux.clone(),
            launcher.clone(),
            daemon_env,
            settings,
        ));
        Self {
            orchestrator,
            registry,
            launcher,
            tmux,
            process,
            home,
        }
    }

    fn plain() -> Self {
        Self::new(FakeMultiplexer::new(false, 0), FakeLauncher::new(5000), None)
    }

    fn workdir(&self) -> PathBuf {
        self.home.path().to_path_buf()
    }

    fn request(&self) -> SpawnRequest {
        SpawnRequest::new(self.workdir(), AgentKind::Claude, "machine-1")
    }

    fn spawn_in_background(&self, request: SpawnRequest) -> tokio::task::JoinHandle<SpawnResult> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move { orchestrator.spawn(request).await })
    }

    async fn wait_for_pending(&self, pid: u32) {
        for _ in 0..400 {
            if self.registry.lock().await.has_pending(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pid {} never registered a pending correlation", pid);
    }

    /// Report-back as a daemon-launched agent sends it.
    async fn report(&self, pid: u32, session_id: &str) -> ReportOutcome {
        self.report_as(pid, session_id, Some(STARTED_BY_DAEMON)).await
    }

    async fn report_as(
        &self,
        pid: u32,
        session_id: &str,
        started_by: Option<&str>,
    ) -> ReportOutcome {
        let metadata = SessionMetadata {
            host_pid: pid,
            path: self.workdir().display().to_string(),
            started_by: started_by.map(str::to_string),
            ..SessionMetadata::default()
        };
        self.registry
            .lock()
            .await
            .report_from_child(session_id.to_string(), metadata)
            .unwrap()
    }
}

fn explicit_env(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

#[tokio::test]
async fn test_plain_spawn_resolves_on_report() {
    let h = Harness::plain();
    let task = h.spawn_in_background(h.request());

    h.wait_for_pending(5000).await;
    {
        let registry = h.registry.lock().await;
        let entry = registry.get(5000).unwrap();
        assert_eq!(entry.started_by, StartedBy::Daemon);
        assert!(entry.child.is_some());
        assert!(entry.tmux_session_id.is_none());
        assert!(!entry.directory_created);
    }

    assert_eq!(h.report(5000, "sess-1").await, ReportOutcome::ResolvedPending);
    assert_eq!(
        task.await.unwrap(),
        SpawnResult::Success {
            session_id: "sess-1".to_string()
        }
    );

    let launches = h.launcher.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].program, "claude");
    assert_eq!(launches[0].cwd, h.workdir());
    assert_eq!(launches[0].env[ENV_DAEMON_PORT], PORT.to_string());
    assert_eq!(launches[0].env[ENV_STARTED_BY], "daemon");
    assert_eq!(launches[0].env[ENV_MACHINE_ID], "machine-1");
    assert!(!launches[0].env.contains_key("CLAUDE_CODE_OAUTH_TOKEN"));
    assert!(h.tmux.launches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_directory_requires_approval() {
    let h = Harness::plain();
    let missing = h.workdir().join("not-yet");
    let request = SpawnRequest::new(&missing, AgentKind::Codex, "m");

    let result = h.orchestrator.spawn(request).await;
    assert_eq!(
        result,
        SpawnResult::RequestToApproveDirectoryCreation {
            directory: missing.clone()
        }
    );
    assert!(!missing.exists());
    assert!(h.launcher.launches().is_empty());
    assert!(h.registry.lock().await.is_empty());
}

#[tokio::test]
async fn test_approved_directory_is_created_and_flagged() {
    let h = Harness::plain();
    let target = h.workdir().join("fresh/project");
    let mut request = SpawnRequest::new(&target, AgentKind::Gemini, "m");
    request.approved_new_directory_creation = true;

    let task = h.spawn_in_background(request);
    h.wait_for_pending(5000).await;
    assert!(target.is_dir());
    assert!(h.registry.lock().await.get(5000).unwrap().directory_created);

    h.report(5000, "sess-new").await;
    assert!(matches!(task.await.unwrap(), SpawnResult::Success { .. }));
}

#[tokio::test]
async fn test_directory_creation_failure_is_one_message() {
    let h = Harness::plain();
    let file = h.workdir().join("occupied");
    std::fs::write(&file, "x").unwrap();
    let mut request = SpawnRequest::new(file.join("sub"), AgentKind::Claude, "m");
    request.approved_new_directory_creation = true;

    match h.orchestrator.spawn(request).await {
        SpawnResult::Error { message } => assert!(message.contains("a file already exists")),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(h.launcher.launches().is_empty());
}

#[tokio::test]
async fn test_unresolved_auth_variable_blocks_spawn() {
    let h = Harness::new(FakeMultiplexer::new(true, 7000), FakeLauncher::new(5000), None);
    let mut request = h.request();
    request.environment_variables = explicit_env(&[
        ("ANTHROPIC_API_KEY", "${NOT_IN_DAEMON_ENV}"),
        ("TMUX_SESSION_NAME", "work"),
    ]);

    match h.orchestrator.spawn(request).await {
        SpawnResult::Error { message } => {
            assert!(message.contains("ANTHROPIC_API_KEY"));
            assert!(message.contains("${NOT_IN_DAEMON_ENV}"));
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert!(h.launcher.launches().is_empty());
    assert!(h.tmux.launches.lock().unwrap().is_empty());
    assert!(h.registry.lock().await.is_empty());
}

#[tokio::test]
async fn test_credential_alias_expands_from_daemon_env() {
    let h = Harness::plain();
    let mut request = h.request();
    request.environment_variables = explicit_env(&[("ANTHROPIC_API_KEY", "${SHARED_SECRET}")]);

    let task = h.spawn_in_background(request);
    h.wait_for_pending(5000).await;
    assert_eq!(h.launcher.launches()[0].env["ANTHROPIC_API_KEY"], "s3cret");

    h.report(5000, "sess").await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_token_overrides_active_profile_value() {
    let profile = Profile {
        id: "work".to_string(),
        environment_variables: vec![
            EnvVar {
                name: "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
                value: "from-profile".to_string(),
            },
            EnvVar {
                name: "ANTHROPIC_BASE_URL".to_string(),
                value: "https://proxy".to_string(),
            },
        ],
        compatibility: AgentCompatibility::default(),
    };
    let h = Harness::new(FakeMultiplexer::new(false, 0), FakeLauncher::new(5000), Some(profile));
    let mut request = h.request();
    request.token = Some("from-auth".to_string());
    request.session_id = Some("resume-1".to_string());

    let task = h.spawn_in_background(request);
    h.wait_for_pending(5000).await;
    let env = &h.launcher.launches()[0].env;
    assert_eq!(env["CLAUDE_CODE_OAUTH_TOKEN"], "from-auth");
    assert_eq!(env["ANTHROPIC_BASE_URL"], "https://proxy");
    assert_eq!(env[ENV_SESSION_ID], "resume-1");

    h.report(5000, "resume-1").await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_tmux_path_passes_complete_environment() {
    let h = Harness::new(FakeMultiplexer::new(true, 7000), FakeLauncher::new(5000), None);
    let mut request = h.request();
    request.environment_variables = explicit_env(&[("TMUX_SESSION_NAME", "work"), ("X", "1")]);

    let task = h.spawn_in_background(request);
    h.wait_for_pending(7000).await;
    {
        let registry = h.registry.lock().await;
        let entry = registry.get(7000).unwrap();
        assert!(entry.child.is_none());
        assert!(entry
            .tmux_session_id
            .as_deref()
            .unwrap()
            .starts_with("work:claude-"));
    }
    {
        let launches = h.tmux.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        let (launch, env) = &launches[0];
        assert_eq!(launch.command, vec!["claude".to_string()]);
        assert_eq!(launch.cwd, h.workdir());
        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["X"], "1");
        assert_eq!(env[ENV_STARTED_BY], "daemon");
    }
    assert!(h.launcher.launches().is_empty());

    h.report(7000, "sess-tmux").await;
    assert_eq!(
        task.await.unwrap(),
        SpawnResult::Success {
            session_id: "sess-tmux".to_string()
        }
    );
}

#[tokio::test]
async fn test_tmux_failure_falls_back_to_plain_process() {
    let mut tmux = FakeMultiplexer::new(true, 7000);
    tmux.fail_with = Some("server exited".to_string());
    let h = Harness::new(tmux, FakeLauncher::new(5000), None);
    let mut request = h.request();
    request.environment_variables = explicit_env(&[("TMUX_SESSION_NAME", "")]);

    let task = h.spawn_in_background(request);
    h.wait_for_pending(5000).await;
    assert_eq!(h.tmux.launches.lock().unwrap().len(), 1);
    assert_eq!(h.launcher.launches().len(), 1);

    h.report(5000, "sess").await;
    assert!(matches!(task.await.unwrap(), SpawnResult::Success { .. }));
}

#[tokio::test]
async fn test_tmux_marker_ignored_when_unavailable() {
    let h = Harness::plain();
    let mut request = h.request();
    request.environment_variables = explicit_env(&[("TMUX_SESSION_NAME", "work")]);

    let task = h.spawn_in_background(request);
    h.wait_for_pending(5000).await;
    assert!(h.tmux.launches.lock().unwrap().is_empty());

    h.report(5000, "sess").await;
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_keeps_child_and_allows_later_adoption() {
    let h = Harness::plain();

    match h.orchestrator.spawn(h.request()).await {
        SpawnResult::Error { message } => assert!(message.contains("did not report")),
        other => panic!("expected timeout, got {:?}", other),
    }

    {
        let registry = h.registry.lock().await;
        assert_eq!(registry.pending_count(), 0);
        let entry = registry.get(5000).unwrap();
        assert_eq!(entry.started_by, StartedBy::External);
        assert!(entry.session_id.is_none());
    }
    assert!(h.process.signals().is_empty(), "timed-out child must not be killed");

    assert_eq!(h.report(5000, "sess-late").await, ReportOutcome::Updated);
    assert_eq!(
        h.registry.lock().await.get(5000).unwrap().session_id.as_deref(),
        Some("sess-late")
    );
}

#[tokio::test]
async fn test_child_exit_before_report_fails_spawn() {
    let h = Harness::plain();
    let task = h.spawn_in_background(h.request());
    h.wait_for_pending(5000).await;

    h.launcher.exit_child(5000);
    assert_eq!(task.await.unwrap(), SpawnResult::error(EXITED_BEFORE_REPORT));
    assert!(h.registry.lock().await.is_empty());
}

#[tokio::test]
async fn test_report_racing_ahead_of_tracking_still_succeeds() {
    let h = Harness::plain();
    // The child reports before the orchestrator records it.
    assert_eq!(h.report(5000, "sess-early").await, ReportOutcome::Adopted);

    let result = h.orchestrator.spawn(h.request()).await;
    assert_eq!(
        result,
        SpawnResult::Success {
            session_id: "sess-early".to_string()
        }
    );
    let registry = h.registry.lock().await;
    assert_eq!(registry.session_count(), 1);
    assert_eq!(registry.get(5000).unwrap().started_by, StartedBy::Daemon);
    assert_eq!(registry.pending_count(), 0);
}

#[tokio::test]
async fn test_stale_external_entry_on_reused_pid_is_not_reused() {
    let h = Harness::plain();
    // An old, externally started session on the pid the launch will get.
    assert_eq!(h.report_as(5000, "sess-old", None).await, ReportOutcome::Adopted);

    let task = h.spawn_in_background(h.request());
    h.wait_for_pending(5000).await;
    {
        let registry = h.registry.lock().await;
        let entry = registry.get(5000).unwrap();
        assert_eq!(entry.started_by, StartedBy::Daemon);
        assert!(entry.session_id.is_none());
    }

    assert_eq!(h.report(5000, "sess-new").await, ReportOutcome::ResolvedPending);
    assert_eq!(
        task.await.unwrap(),
        SpawnResult::Success {
            session_id: "sess-new".to_string()
        }
    );
}

#[tokio::test]
async fn test_agents_run_under_the_report_back_wrapper() {
    let h = Harness::with_settings(
        FakeMultiplexer::new(false, 0),
        FakeLauncher::new(5000),
        None,
        |settings| settings.launcher = Some(PathBuf::from("/opt/bin/sessiond")),
    );
    let mut request = h.request();
    request.agent = AgentKind::Codex;

    let task = h.spawn_in_background(request);
    h.wait_for_pending(5000).await;
    let launches = h.launcher.launches();
    assert_eq!(launches[0].program, "/opt/bin/sessiond");
    assert_eq!(
        launches[0].args,
        ["agent", "codex", "--", "codex"]
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
    );

    h.report(5000, "sess").await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_hook_reporting_agents_run_unwrapped() {
    let h = Harness::with_settings(
        FakeMultiplexer::new(true, 7000),
        FakeLauncher::new(5000),
        None,
        |settings| {
            settings.launcher = Some(PathBuf::from("/opt/bin/sessiond"));
            settings.agents.claude.report_back = false;
            settings.agents.claude.args = vec!["--verbose".to_string()];
        },
    );
    let mut request = h.request();
    request.environment_variables = explicit_env(&[("TMUX_SESSION_NAME", "work")]);

    let task = h.spawn_in_background(request);
    h.wait_for_pending(7000).await;
    {
        let launches = h.tmux.launches.lock().unwrap();
        assert_eq!(
            launches[0].0.command,
            vec!["claude".to_string(), "--verbose".to_string()]
        );
    }

    h.report(7000, "sess").await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_launch_failure_is_reported() {
    let mut launcher = FakeLauncher::new(5000);
    launcher.fail_with = Some("claude: command not found".to_string());
    let h = Harness::new(FakeMultiplexer::new(false, 0), launcher, None);

    match h.orchestrator.spawn(h.request()).await {
        SpawnResult::Error { message } => assert!(message.contains("command not found")),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(h.registry.lock().await.is_empty());
}

#[test]
fn test_expand_home() {
    assert_eq!(expand_home(Path::new("/abs/path")), PathBuf::from("/abs/path"));
    if let Some(home) = dirs::home_dir() {
        assert_eq!(expand_home(Path::new("~/proj")), home.join("proj"));
    }
}
