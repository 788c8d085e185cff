use crate::agent::AgentKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Overrides `heartbeat_interval_ms`.
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "SESSIOND_HEARTBEAT_INTERVAL_MS";
/// Overrides `spawn_correlation_timeout_ms`.
pub const ENV_SPAWN_TIMEOUT_MS: &str = "SESSIOND_SPAWN_TIMEOUT_MS";

/// Daemon tuning. Every field has a default, so an empty or missing
/// `config.yaml` is a valid configuration.
///
/// The health interval and the spawn correlation timeout are independent
/// settings; neither is derived from the other.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Health loop period.
    pub heartbeat_interval_ms: u64,
    /// How long a spawn waits for the child to report its session id.
    pub spawn_correlation_timeout_ms: u64,
    pub lock_max_retries: u32,
    pub lock_retry_delay_ms: u64,
    /// Fallback before a forced exit(1) when shutdown arrives during startup.
    pub startup_shutdown_grace_ms: u64,
    /// Bound on the "shutting-down" push to the upstream sync client.
    pub upstream_push_timeout_ms: u64,
    /// How long the old daemon waits to be stopped by its replacement.
    pub restart_handoff_timeout_ms: u64,
    /// How long startup waits for a previous daemon to exit before SIGKILL.
    pub stop_old_daemon_timeout_ms: u64,
    pub agents: AgentCommands,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 60_000,
            spawn_correlation_timeout_ms: 15_000,
            lock_max_retries: 5,
            lock_retry_delay_ms: 200,
            startup_shutdown_grace_ms: 5_000,
            upstream_push_timeout_ms: 2_000,
            restart_handoff_timeout_ms: 10_000,
            stop_old_daemon_timeout_ms: 5_000,
            agents: AgentCommands::default(),
        }
    }
}

/// Per-agent invocation settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentCommands {
    #[serde(default = "default_claude")]
    pub claude: AgentCommand,
    #[serde(default = "default_codex")]
    pub codex: AgentCommand,
    #[serde(default = "default_gemini")]
    pub gemini: AgentCommand,
}

impl Default for AgentCommands {
    fn default() -> Self {
        Self {
            claude: default_claude(),
            codex: default_codex(),
            gemini: default_gemini(),
        }
    }
}

impl AgentCommands {
    pub fn get(&self, kind: AgentKind) -> &AgentCommand {
        match kind {
            AgentKind::Claude => &self.claude,
            AgentKind::Codex => &self.codex,
            AgentKind::Gemini => &self.gemini,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Run under `sessiond agent`, which reports the session id back. Turn
    /// off for agents that report through their own hooks.
    #[serde(default = "default_report_back")]
    pub report_back: bool,
}

impl AgentCommand {
    fn for_kind(kind: AgentKind) -> Self {
        Self {
            command: kind.default_command().to_string(),
            args: Vec::new(),
            report_back: true,
        }
    }
}

fn default_report_back() -> bool {
    true
}

fn default_claude() -> AgentCommand {
    AgentCommand::for_kind(AgentKind::Claude)
}

fn default_codex() -> AgentCommand {
    AgentCommand::for_kind(AgentKind::Codex)
}

fn default_gemini() -> AgentCommand {
    AgentCommand::for_kind(AgentKind::Gemini)
}

impl DaemonConfig {
    /// Loads `config.yaml`, falling back to defaults when the file is absent,
    /// then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            if content.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str(&content).with_context(|| {
                    format!("Failed to parse config file as YAML: {}", path.display())
                })?
            }
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_millis(ENV_HEARTBEAT_INTERVAL_MS) {
            self.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = env_millis(ENV_SPAWN_TIMEOUT_MS) {
            self.spawn_correlation_timeout_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be greater than zero");
        }
        if self.spawn_correlation_timeout_ms == 0 {
            anyhow::bail!("spawn_correlation_timeout_ms must be greater than zero");
        }
        for kind in AgentKind::ALL {
            if self.agents.get(kind).command.trim().is_empty() {
                anyhow::bail!("agents.{}.command must not be empty", kind);
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn spawn_correlation_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_correlation_timeout_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub fn startup_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.startup_shutdown_grace_ms)
    }

    pub fn upstream_push_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_push_timeout_ms)
    }

    pub fn restart_handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_handoff_timeout_ms)
    }

    pub fn stop_old_daemon_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_old_daemon_timeout_ms)
    }
}

fn env_millis(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|ms| *ms > 0)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
