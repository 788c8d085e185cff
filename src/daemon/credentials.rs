//! Auth layer: turns a caller-supplied token into agent environment.
//!
//! Token-based agents get the token in their provider variable. File-based
//! agents get a credentials file in a private per-agent directory, and the
//! directory is passed in their home variable.

use crate::agent::{AgentKind, CredentialTarget};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes credentials below `<root>/<agent>/`.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// `root` is the `credentials/` directory of the daemon home.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn agent_dir(&self, agent: AgentKind) -> PathBuf {
        self.root.join(agent.as_str())
    }

    /// Environment derived from `token` for `agent`. No token, no variables.
    pub fn auth_env(
        &self,
        agent: AgentKind,
        token: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(env);
        };

        match agent.credential_target() {
            CredentialTarget::TokenVar(var) => {
                env.insert(var.to_string(), token.to_string());
            }
            CredentialTarget::CredentialsFile { dir_var, file_name } => {
                let dir = self.agent_dir(agent);
                write_private_file(&dir, file_name, &credentials_file_body(token)?)?;
                env.insert(dir_var.to_string(), dir.display().to_string());
            }
        }
        Ok(env)
    }
}

/// A token that already is a JSON object is written as-is; a bare token is
/// wrapped as an API key entry.
fn credentials_file_body(token: &str) -> Result<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(token) {
        if value.is_object() {
            return Ok(serde_json::to_string_pretty(&value)?);
        }
    }
    let wrapped = serde_json::json!({ "OPENAI_API_KEY": token });
    Ok(serde_json::to_string_pretty(&wrapped)?)
}

/// Writes `dir/name` with mode 0600 inside a 0700 directory.
fn write_private_file(dir: &Path, name: &str, content: &str) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create credentials dir: {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to restrict {}", dir.display()))?;
    }

    let path = dir.join(name);
    // Concurrent spawns for the same agent each stage their own file.
    let tmp = dir.join(format!(
        ".{}.tmp-{}-{:016x}",
        name,
        std::process::id(),
        rand::random::<u64>()
    ));
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to install {}", path.display()));
    }
    Ok(())
}
