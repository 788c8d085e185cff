//! `sessiond agent`: runs an agent CLI under a known session id and reports
//! that id to the daemon before handing the process over to the agent.
//!
//! The daemon tracks the pid it launched. Reporting first and then exec-ing
//! the agent keeps that pid, so the report, the tracked entry and the running
//! agent all name the same process.

use crate::agent::{AgentKind, ENV_DAEMON_PORT, ENV_MACHINE_ID, ENV_SESSION_ID, ENV_STARTED_BY};
use crate::client::ControlClient;
use crate::rpc::{ReportOutcome, SessionMetadata};
use anyhow::{Context, Result};
use std::collections::BTreeMap;

/// The agent command line `sessiond agent` hands the process to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLaunch {
    pub session_id: String,
    pub program: String,
    pub args: Vec<String>,
}

/// Pins the session id: `resume` when the daemon passed one down, a fresh
/// UUID otherwise.
pub fn plan_launch(
    kind: AgentKind,
    command: &[String],
    resume: Option<String>,
) -> Result<AgentLaunch> {
    let (program, rest) = command.split_first().context("No agent command given")?;
    let (session_id, resuming) = match resume.filter(|id| !id.trim().is_empty()) {
        Some(id) => (id, true),
        None => (uuid::Uuid::new_v4().to_string(), false),
    };
    let mut args = kind.session_args(&session_id, resuming);
    args.extend(rest.iter().cloned());
    Ok(AgentLaunch {
        session_id,
        program: program.clone(),
        args,
    })
}

/// Report-back metadata for `host_pid`, read from the environment the daemon
/// prepared for the launch.
pub fn session_metadata(
    host_pid: u32,
    agent: Option<AgentKind>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<SessionMetadata> {
    Ok(SessionMetadata {
        host_pid,
        path: std::env::current_dir()
            .context("Failed to read current directory")?
            .display()
            .to_string(),
        machine_id: lookup(ENV_MACHINE_ID),
        agent,
        started_by: lookup(ENV_STARTED_BY),
        extra: BTreeMap::new(),
    })
}

pub async fn run_agent(kind: AgentKind, command: Vec<String>) -> Result<()> {
    let env = |name: &str| std::env::var(name).ok();
    let launch = plan_launch(kind, &command, env(ENV_SESSION_ID))?;

    match env(ENV_DAEMON_PORT).and_then(|port| port.parse::<u16>().ok()) {
        Some(port) => {
            let metadata = session_metadata(std::process::id(), Some(kind), env)?;
            // The agent runs either way; the daemon adopts it on timeout.
            if let Err(e) = report(port, &launch.session_id, metadata).await {
                eprintln!(
                    "sessiond: could not report session {}: {:#}",
                    launch.session_id, e
                );
            }
        }
        None => eprintln!(
            "sessiond: {} is not set, running {} without report-back",
            ENV_DAEMON_PORT, kind
        ),
    }

    exec_agent(&launch)
}

async fn report(port: u16, session_id: &str, metadata: SessionMetadata) -> Result<ReportOutcome> {
    ControlClient::connect_with_retry(port)
        .await?
        .report_session(session_id, metadata)
        .await
}

#[cfg(unix)]
fn exec_agent(launch: &AgentLaunch) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(&launch.program)
        .args(&launch.args)
        .exec();
    Err(err).with_context(|| format!("Failed to exec {}", launch.program))
}

#[cfg(not(unix))]
fn exec_agent(launch: &AgentLaunch) -> Result<()> {
    let status = std::process::Command::new(&launch.program)
        .args(&launch.args)
        .status()
        .with_context(|| format!("Failed to run {}", launch.program))?;
    std::process::exit(status.code().unwrap_or(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_new_claude_session_gets_a_fresh_id() {
        let launch = plan_launch(AgentKind::Claude, &command(&["claude", "--verbose"]), None).unwrap();
        assert!(uuid::Uuid::parse_str(&launch.session_id).is_ok());
        assert_eq!(launch.program, "claude");
        assert_eq!(
            launch.args,
            vec!["--session-id".to_string(), launch.session_id.clone(), "--verbose".to_string()]
        );
    }

    #[test]
    fn test_resume_keeps_the_given_id() {
        let launch = plan_launch(
            AgentKind::Codex,
            &command(&["/opt/bin/codex", "--full-auto"]),
            Some("sess-42".to_string()),
        )
        .unwrap();
        assert_eq!(launch.session_id, "sess-42");
        assert_eq!(launch.args, command(&["resume", "sess-42", "--full-auto"]));
    }

    #[test]
    fn test_blank_resume_id_starts_a_new_session() {
        let launch = plan_launch(AgentKind::Gemini, &command(&["gemini"]), Some("  ".to_string()))
            .unwrap();
        assert_ne!(launch.session_id.trim(), "");
        assert!(launch.args.is_empty());
    }

    #[test]
    fn test_empty_command_is_an_error() {
        assert!(plan_launch(AgentKind::Claude, &[], None).is_err());
    }

    #[test]
    fn test_metadata_comes_from_the_launch_environment() {
        let lookup = |name: &str| match name {
            ENV_MACHINE_ID => Some("laptop".to_string()),
            ENV_STARTED_BY => Some("daemon".to_string()),
            _ => None,
        };
        let metadata = session_metadata(4242, Some(AgentKind::Claude), lookup).unwrap();
        assert_eq!(metadata.host_pid, 4242);
        assert_eq!(metadata.machine_id.as_deref(), Some("laptop"));
        assert_eq!(metadata.started_by.as_deref(), Some("daemon"));
        assert_eq!(metadata.agent, Some(AgentKind::Claude));
        assert!(!metadata.path.is_empty());
    }
}
