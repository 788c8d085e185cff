//! Terminal-multiplexer launch path.
//!
//! Sessions started inside tmux survive daemon restarts and can be
//! reattached by the user. tmux starts panes from its server's environment,
//! not ours, so the complete environment is passed explicitly with `-e`.

use crate::daemon_log::daemon_log;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;

/// Resolved-env key selecting the multiplexer path.
pub const TMUX_SESSION_ENV: &str = "TMUX_SESSION_NAME";

/// Session created when "most recent" finds no session at all.
pub const DEFAULT_TMUX_SESSION: &str = "agents";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmuxTarget {
    Named(String),
    /// The most recently attached session.
    MostRecent,
}

impl TmuxTarget {
    /// Reads the marker from the resolved environment. An empty value means
    /// the most recent session; no key means no multiplexer.
    pub fn from_env(env: &BTreeMap<String, String>) -> Option<Self> {
        let value = env.get(TMUX_SESSION_ENV)?.trim();
        if value.is_empty() {
            Some(Self::MostRecent)
        } else {
            Some(Self::Named(value.to_string()))
        }
    }

    #[cfg(test)]
    pub fn name_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self {
            Self::Named(name) => name.as_str(),
            Self::MostRecent => fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxLaunch {
    pub session: TmuxTarget,
    pub window_name: String,
    pub cwd: PathBuf,
    /// Program and arguments, executed without an intermediate shell.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxLaunchResult {
    pub success: bool,
    /// `<session>:<window>`.
    pub session_id: Option<String>,
    /// OS pid of the process running in the new pane.
    pub pid: Option<u32>,
    pub error: Option<String>,
}

impl TmuxLaunchResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            pid: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait Multiplexer: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Opens a window running `launch.command` with exactly `env`.
    async fn spawn_in_tmux(
        &self,
        launch: &TmuxLaunch,
        env: &BTreeMap<String, String>,
    ) -> TmuxLaunchResult;
}

/// The `tmux` binary on `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TmuxCli;

impl TmuxCli {
    async fn tmux(&self, args: &[String]) -> Result<String, String> {
        let output = Command::new("tmux")
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| format!("Failed to run tmux: {}", e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    async fn has_session(&self, name: &str) -> bool {
        self.tmux(&["has-session".to_string(), "-t".to_string(), format!("={}", name)])
            .await
            .is_ok()
    }

    async fn most_recent_session(&self) -> Option<String> {
        let listing = self
            .tmux(&[
                "list-sessions".to_string(),
                "-F".to_string(),
                "#{session_last_attached} #{session_name}".to_string(),
            ])
            .await
            .ok()?;
        pick_most_recent(&listing)
    }
}

#[async_trait::async_trait]
impl Multiplexer for TmuxCli {
    async fn is_available(&self) -> bool {
        if which::which("tmux").is_err() {
            return false;
        }
        self.tmux(&["-V".to_string()]).await.is_ok()
    }

    async fn spawn_in_tmux(
        &self,
        launch: &TmuxLaunch,
        env: &BTreeMap<String, String>,
    ) -> TmuxLaunchResult {
        let (session, exists) = match &launch.session {
            TmuxTarget::Named(name) => (name.clone(), self.has_session(name).await),
            TmuxTarget::MostRecent => match self.most_recent_session().await {
                Some(name) => (name, true),
                None => (DEFAULT_TMUX_SESSION.to_string(), false),
            },
        };

        let args = launch_args(&session, exists, launch, env);
        daemon_log(
            "tmux",
            &format!(
                "Opening window {} in session {} ({} env vars)",
                launch.window_name,
                session,
                env.len()
            ),
        );
        let stdout = match self.tmux(&args).await {
            Ok(stdout) => stdout,
            Err(e) => return TmuxLaunchResult::failed(format!("tmux launch failed: {}", e)),
        };

        match parse_pane_pid(&stdout) {
            Some(pid) => TmuxLaunchResult {
                success: true,
                session_id: Some(format!("{}:{}", session, launch.window_name)),
                pid: Some(pid),
                error: None,
            },
            None => TmuxLaunchResult::failed(format!(
                "tmux did not report a pane pid (output: {:?})",
                stdout.trim()
            )),
        }
    }
}

/// Builds the `new-window` / `new-session` invocation.
fn launch_args(
    session: &str,
    session_exists: bool,
    launch: &TmuxLaunch,
    env: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args: Vec<String> = if session_exists {
        vec![
            "new-window".into(),
            "-d".into(),
            "-t".into(),
            format!("{}:", session),
        ]
    } else {
        vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            session.to_string(),
        ]
    };
    args.extend([
        "-n".into(),
        launch.window_name.clone(),
        "-c".into(),
        launch.cwd.display().to_string(),
    ]);
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }
    args.extend(["-P", "-F", "#{pane_pid}"].map(String::from));

    // tmux hands a single argument to `sh -c`; `exec` keeps the pane pid
    // pointing at the agent rather than a shell.
    match launch.command.as_slice() {
        [single] => args.push(format!("exec {}", shell_quote(single))),
        many => args.extend(many.iter().cloned()),
    }
    args
}

fn parse_pane_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}

/// Picks the session with the highest last-attached timestamp.
fn pick_most_recent(listing: &str) -> Option<String> {
    listing
        .lines()
        .filter_map(|line| {
            let (stamp, name) = line.trim().split_once(' ')?;
            Some((stamp.parse::<u64>().unwrap_or(0), name.to_string()))
        })
        .max_by_key(|(stamp, _)| *stamp)
        .map(|(_, name)| name)
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(command: &[&str]) -> TmuxLaunch {
        TmuxLaunch {
            session: TmuxTarget::Named("work".to_string()),
            window_name: "claude-1700000000000".to_string(),
            cwd: PathBuf::from("/repo"),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_marker_from_env() {
        let mut env = BTreeMap::new();
        assert_eq!(TmuxTarget::from_env(&env), None);
        env.insert(TMUX_SESSION_ENV.to_string(), String::new());
        assert_eq!(TmuxTarget::from_env(&env), Some(TmuxTarget::MostRecent));
        env.insert(TMUX_SESSION_ENV.to_string(), " dev ".to_string());
        assert_eq!(
            TmuxTarget::from_env(&env),
            Some(TmuxTarget::Named("dev".to_string()))
        );
    }

    #[test]
    fn test_new_window_args_pass_every_variable() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "1".to_string());
        env.insert("PATH".to_string(), "/bin".to_string());
        let args = launch_args("work", true, &launch(&["claude", "--resume"]), &env);

        assert_eq!(&args[..4], &["new-window", "-d", "-t", "work:"]);
        assert!(args.windows(2).any(|w| w == ["-e", "A=1"]));
        assert!(args.windows(2).any(|w| w == ["-e", "PATH=/bin"]));
        assert!(args.windows(2).any(|w| w == ["-c", "/repo"]));
        assert!(args.windows(3).any(|w| w == ["-P", "-F", "#{pane_pid}"]));
        assert_eq!(&args[args.len() - 2..], &["claude", "--resume"]);
    }

    #[test]
    fn test_new_session_when_missing_and_single_command_uses_exec() {
        let args = launch_args("agents", false, &launch(&["my agent"]), &BTreeMap::new());
        assert_eq!(&args[..4], &["new-session", "-d", "-s", "agents"]);
        assert_eq!(args.last().unwrap(), "exec 'my agent'");
    }

    #[test]
    fn test_parse_pane_pid() {
        assert_eq!(parse_pane_pid("4242\n"), Some(4242));
        assert_eq!(parse_pane_pid(""), None);
        assert_eq!(parse_pane_pid("%3"), None);
        assert_eq!(parse_pane_pid("0"), None);
    }

    #[test]
    fn test_pick_most_recent() {
        let listing = "100 old\n300 newest\n0 never\n";
        assert_eq!(pick_most_recent(listing), Some("newest".to_string()));
        assert_eq!(pick_most_recent(""), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("claude"), "claude");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
