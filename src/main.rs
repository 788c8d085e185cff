mod agent;
mod client;
mod config;
mod daemon;
mod daemon_log;
mod launcher;
mod paths;
mod rpc;
mod version;

use agent::{AgentKind, ENV_DAEMON_PORT};
use anyhow::Result;
use clap::{Parser, Subcommand};
use client::{ControlClient, StopOutcome};
use config::DaemonConfig;
use daemon::process::{ProcessControl, SystemProcess};
use daemon::state_store::StateStore;
use paths::DaemonPaths;
use rpc::{ShutdownOrigin, SpawnRequest, SpawnResult};
use std::path::PathBuf;
use std::time::Duration;

/// How long `start` waits for the new daemon's heartbeat.
const START_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "sessiond")]
#[command(about = "Per-machine daemon that launches and tracks coding agent sessions")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon in the background
    Start,
    /// Run the daemon in the foreground
    Run,
    /// Stop the running daemon
    Stop,
    /// Show the daemon's heartbeat and liveness
    Status,
    /// List tracked sessions
    List,
    /// Launch an agent session through the daemon
    Spawn {
        /// Working directory for the agent
        #[arg(long)]
        dir: PathBuf,

        #[arg(long, default_value = "claude")]
        agent: AgentKind,

        /// Session id to resume
        #[arg(long)]
        session_id: Option<String>,

        /// Create the directory if it does not exist
        #[arg(long)]
        approve_dir: bool,

        /// Auth token handed to the agent
        #[arg(long)]
        token: Option<String>,

        /// Profile variables (KEY=VALUE); replaces the active profile
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Machine id (defaults to the host name)
        #[arg(long)]
        machine_id: Option<String>,
    },
    /// Stop one session by pid, PID-<n>, or session id
    StopSession { id: String },
    /// Report a session id back to the daemon (run by spawned agents)
    Report {
        #[arg(long)]
        session_id: String,

        /// Agent process id (defaults to this helper's parent)
        #[arg(long)]
        pid: Option<u32>,

        #[arg(long)]
        agent: Option<AgentKind>,
    },
    /// Run an agent and report its session id to the daemon (used by spawns)
    #[command(hide = true)]
    Agent {
        agent: AgentKind,

        /// Agent command line, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn default_machine_id() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = DaemonPaths::from_env()?;

    match cli.command {
        Command::Start => start(&paths).await,
        Command::Run => daemon::run_daemon(paths).await,
        Command::Stop => stop(&paths).await,
        Command::Status => status(&paths).await,
        Command::List => list(&paths).await,
        Command::Spawn {
            dir,
            agent,
            session_id,
            approve_dir,
            token,
            env,
            machine_id,
        } => {
            let machine_id = machine_id.unwrap_or_else(default_machine_id);
            let mut request = SpawnRequest::new(dir, agent, &machine_id);
            request.session_id = session_id;
            request.approved_new_directory_creation = approve_dir;
            request.token = token;
            if !env.is_empty() {
                request.environment_variables = Some(env.into_iter().collect());
            }
            spawn(&paths, request).await
        }
        Command::StopSession { id } => {
            let client = ControlClient::from_state(&paths).await?;
            if client.stop_session(&id).await? {
                println!("Stopped {}", id);
                Ok(())
            } else {
                anyhow::bail!("No session matches {}", id)
            }
        }
        Command::Report {
            session_id,
            pid,
            agent,
        } => report(&paths, session_id, pid, agent).await,
        Command::Agent { agent, command } => launcher::run_agent(agent, command).await,
    }
}

async fn start(paths: &DaemonPaths) -> Result<()> {
    let store = StateStore::new(paths.state_path());
    if let Some(state) = store.read() {
        if SystemProcess.is_alive(state.pid)
            && state.started_with_cli_version == version::CLI_VERSION
        {
            println!(
                "Daemon already running (pid {}, port {})",
                state.pid, state.http_port
            );
            return Ok(());
        }
    }

    let pid = client::spawn_daemon_detached(paths)?;
    let state = client::wait_for_heartbeat(&store, pid, START_TIMEOUT).await?;
    println!(
        "Daemon started (pid {}, port {})",
        state.pid, state.http_port
    );
    Ok(())
}

async fn stop(paths: &DaemonPaths) -> Result<()> {
    let config = DaemonConfig::load(&paths.config_path())?;
    let store = StateStore::new(paths.state_path());
    let outcome = client::stop_daemon(
        &store,
        &SystemProcess,
        ShutdownOrigin::Cli,
        config.stop_old_daemon_timeout(),
    )
    .await?;
    match outcome {
        StopOutcome::NotRunning => println!("Daemon is not running"),
        StopOutcome::Stale { pid } => println!("Daemon pid {} was not running; cleared state", pid),
        StopOutcome::Stopped { pid } => println!("Daemon pid {} stopped", pid),
        StopOutcome::Killed { pid } => println!("Daemon pid {} did not stop in time; killed", pid),
    }
    Ok(())
}

async fn status(paths: &DaemonPaths) -> Result<()> {
    let Some(state) = StateStore::new(paths.state_path()).read() else {
        println!("Daemon is not running");
        return Ok(());
    };
    let alive = SystemProcess.is_alive(state.pid);
    println!("pid:            {} ({})", state.pid, if alive { "alive" } else { "dead" });
    println!("port:           {}", state.http_port);
    println!("version:        {}", state.started_with_cli_version);
    println!("started:        {}", state.start_time);
    println!(
        "last heartbeat: {}",
        state.last_heartbeat.as_deref().unwrap_or("-")
    );
    println!("log:            {}", state.daemon_log_path);
    if alive {
        if let Ok(client) = ControlClient::connect(state.http_port).await {
            let info = client.status().await?;
            println!("sessions:       {}", info.session_count);
            println!("build:          {}", info.build_sha);
        }
    }
    Ok(())
}

async fn list(paths: &DaemonPaths) -> Result<()> {
    let client = ControlClient::from_state(paths).await?;
    let sessions = client.list_sessions().await?;
    if sessions.is_empty() {
        println!("No tracked sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{:>8}  {:<8}  {:<38}  {}{}",
            session.pid,
            format!("{:?}", session.started_by).to_lowercase(),
            session.session_id.as_deref().unwrap_or("-"),
            session.tmux_session_id.as_deref().unwrap_or(""),
            if session.awaiting_report {
                " (awaiting report)"
            } else {
                ""
            },
        );
    }
    Ok(())
}

async fn spawn(paths: &DaemonPaths, request: SpawnRequest) -> Result<()> {
    let config = DaemonConfig::load(&paths.config_path())?;
    let client = ControlClient::from_state(paths).await?;
    match client
        .spawn_session(request, config.spawn_correlation_timeout())
        .await?
    {
        SpawnResult::Success { session_id } => {
            println!("{}", session_id);
            Ok(())
        }
        SpawnResult::RequestToApproveDirectoryCreation { directory } => anyhow::bail!(
            "Directory {} does not exist; re-run with --approve-dir to create it",
            directory.display()
        ),
        SpawnResult::Error { message } => anyhow::bail!("{}", message),
    }
}

async fn report(
    paths: &DaemonPaths,
    session_id: String,
    pid: Option<u32>,
    agent: Option<AgentKind>,
) -> Result<()> {
    let host_pid = match pid {
        Some(pid) => pid,
        None => parent_pid()?,
    };
    let metadata = launcher::session_metadata(host_pid, agent, |name| std::env::var(name).ok())?;

    // Spawned agents are told the port directly; fall back to the heartbeat.
    let client = match std::env::var(ENV_DAEMON_PORT)
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
    {
        Some(port) => ControlClient::connect_with_retry(port).await?,
        None => ControlClient::from_state(paths).await?,
    };
    let outcome = client.report_session(&session_id, metadata).await?;
    println!("{:?}", outcome);
    Ok(())
}

#[cfg(unix)]
fn parent_pid() -> Result<u32> {
    Ok(std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn parent_pid() -> Result<u32> {
    anyhow::bail!("--pid is required on this platform")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(
            parse_key_val("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_spawn_args_parse() {
        let cli = Cli::try_parse_from([
            "sessiond",
            "spawn",
            "--dir",
            "/work",
            "--agent",
            "codex",
            "--env",
            "A=1",
            "--env",
            "B=2",
        ])
        .unwrap();
        match cli.command {
            Command::Spawn { agent, env, .. } => {
                assert_eq!(agent, AgentKind::Codex);
                assert_eq!(env.len(), 2);
            }
            _ => panic!("expected spawn"),
        }
    }

    #[test]
    fn test_agent_wrapper_args_parse() {
        let cli = Cli::try_parse_from([
            "sessiond",
            "agent",
            "codex",
            "--",
            "codex",
            "--full-auto",
        ])
        .unwrap();
        match cli.command {
            Command::Agent { agent, command } => {
                assert_eq!(agent, AgentKind::Codex);
                assert_eq!(command, vec!["codex".to_string(), "--full-auto".to_string()]);
            }
            _ => panic!("expected agent"),
        }
        assert!(Cli::try_parse_from(["sessiond", "agent", "codex"]).is_err());
    }
}
