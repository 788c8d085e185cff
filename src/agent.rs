//! Agent kinds the daemon can launch and their invocation contract.
//!
//! The agent CLIs themselves are external programs. What matters here is how
//! they are started (command, args, environment) and which variables carry
//! their credentials.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable carrying the daemon control port to spawned agents.
pub const ENV_DAEMON_PORT: &str = "SESSIOND_PORT";
/// Environment variable marking a process as daemon-started.
pub const ENV_STARTED_BY: &str = "SESSIOND_STARTED_BY";
/// Value of [`ENV_STARTED_BY`] for daemon launches.
pub const STARTED_BY_DAEMON: &str = "daemon";
/// Environment variable carrying a pre-known session id to resume.
pub const ENV_SESSION_ID: &str = "SESSIOND_SESSION_ID";
/// Environment variable carrying the requesting machine id.
pub const ENV_MACHINE_ID: &str = "SESSIOND_MACHINE_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Claude, AgentKind::Codex, AgentKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    /// Default executable name looked up on `PATH`.
    pub fn default_command(&self) -> &'static str {
        self.as_str()
    }

    /// Arguments that pin the agent's session id: resume `id`, or start a
    /// new session under it where the CLI lets the caller choose.
    pub fn session_args(&self, id: &str, resume: bool) -> Vec<String> {
        let args: &[&str] = match (self, resume) {
            (Self::Claude, true) => &["--resume", id],
            (Self::Claude, false) => &["--session-id", id],
            (Self::Codex, true) => &["resume", id],
            (Self::Gemini, true) => &["--resume", id],
            (Self::Codex | Self::Gemini, false) => &[],
        };
        args.iter().map(|a| a.to_string()).collect()
    }

    /// How an auth token reaches this agent.
    pub fn credential_target(&self) -> CredentialTarget {
        match self {
            Self::Claude => CredentialTarget::TokenVar("CLAUDE_CODE_OAUTH_TOKEN"),
            Self::Gemini => CredentialTarget::TokenVar("GEMINI_API_KEY"),
            Self::Codex => CredentialTarget::CredentialsFile {
                dir_var: "CODEX_HOME",
                file_name: "auth.json",
            },
        }
    }

    /// Variables whose values must be fully expanded before this agent may start.
    pub fn auth_relevant_vars(&self) -> &'static [&'static str] {
        match self {
            Self::Claude => &[
                "ANTHROPIC_API_KEY",
                "ANTHROPIC_AUTH_TOKEN",
                "ANTHROPIC_BASE_URL",
                "CLAUDE_CODE_OAUTH_TOKEN",
            ],
            Self::Codex => &["OPENAI_API_KEY", "OPENAI_BASE_URL", "CODEX_HOME"],
            Self::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY", "GOOGLE_CLOUD_PROJECT"],
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            other => anyhow::bail!("Unknown agent kind: {}", other),
        }
    }
}

/// Where the auth layer puts a caller-supplied token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialTarget {
    /// Token is passed directly in this variable.
    TokenVar(&'static str),
    /// Token is written to `<credentials dir>/<file_name>` and the directory
    /// is passed in `dir_var`.
    CredentialsFile {
        dir_var: &'static str,
        file_name: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_parse_and_display() {
        for kind in AgentKind::ALL {
            let parsed: AgentKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!("  Claude ".parse::<AgentKind>().unwrap(), AgentKind::Claude);
        assert!("cursor".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_token_var_is_auth_relevant() {
        for kind in AgentKind::ALL {
            let var = match kind.credential_target() {
                CredentialTarget::TokenVar(var) => var,
                CredentialTarget::CredentialsFile { dir_var, .. } => dir_var,
            };
            assert!(
                kind.auth_relevant_vars().contains(&var),
                "{} must pre-flight check {}",
                kind,
                var
            );
        }
    }

    #[test]
    fn test_session_args() {
        assert_eq!(
            AgentKind::Claude.session_args("abc", false),
            vec!["--session-id", "abc"]
        );
        assert_eq!(AgentKind::Claude.session_args("abc", true), vec!["--resume", "abc"]);
        assert_eq!(AgentKind::Codex.session_args("abc", true), vec!["resume", "abc"]);
        assert!(AgentKind::Codex.session_args("abc", false).is_empty());
        assert!(AgentKind::Gemini.session_args("abc", false).is_empty());
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&AgentKind::Gemini).unwrap();
        assert_eq!(json, "\"gemini\"");
    }
}
