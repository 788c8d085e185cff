//! Locally configured profiles, read from `settings.json`.
//!
//! A profile is a named bundle of environment variables. The settings file
//! may mark one profile active; it is the implicit fallback when a spawn
//! request carries no explicit variables.

use crate::agent::AgentKind;
use crate::daemon_log::daemon_log;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Which agents a profile may be used with. Missing flags mean compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCompatibility {
    #[serde(default = "yes")]
    pub claude: bool,
    #[serde(default = "yes")]
    pub codex: bool,
    #[serde(default = "yes")]
    pub gemini: bool,
}

fn yes() -> bool {
    true
}

impl Default for AgentCompatibility {
    fn default() -> Self {
        Self {
            claude: true,
            codex: true,
            gemini: true,
        }
    }
}

impl AgentCompatibility {
    pub fn allows(&self, agent: AgentKind) -> bool {
        match agent {
            AgentKind::Claude => self.claude,
            AgentKind::Codex => self.codex,
            AgentKind::Gemini => self.gemini,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub environment_variables: Vec<EnvVar>,
    #[serde(default)]
    pub compatibility: AgentCompatibility,
}

impl Profile {
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.environment_variables
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub active_profile_id: Option<String>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// Read access to the locally configured profiles.
pub trait ProfileSource: Send + Sync {
    /// The active profile, if one is selected and exists.
    fn active_profile(&self) -> Option<Profile>;
}

/// Profiles from `settings.json`, re-read on every lookup so edits apply
/// to the next spawn without restarting the daemon.
pub struct SettingsFileProfiles {
    path: PathBuf,
}

impl SettingsFileProfiles {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings: {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings: {}", self.path.display()))
    }
}

impl ProfileSource for SettingsFileProfiles {
    fn active_profile(&self) -> Option<Profile> {
        let settings = match self.load() {
            Ok(settings) => settings,
            Err(e) => {
                daemon_log("profiles", &format!("Ignoring settings: {:#}", e));
                return None;
            }
        };
        let active = settings.active_profile_id?;
        settings.profiles.into_iter().find(|p| p.id == active)
    }
}
