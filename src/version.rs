//! Build identity and the installed-version lookup used for drift detection.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Version this binary was built as. Recorded in the heartbeat at startup.
pub const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const BUILD_SHA: &str = env!("SESSIOND_GIT_SHA");

/// Reports which version is currently installed on disk.
pub trait VersionSource: Send + Sync {
    fn installed_version(&self) -> Result<String>;
}

/// Asks the binary at our executable path for its version.
///
/// When a package manager replaces the binary while the daemon runs, the
/// path now holds the new build, so `--version` reports the new version.
pub struct ExecutableVersionSource {
    exe: PathBuf,
}

impl ExecutableVersionSource {
    pub fn current() -> Result<Self> {
        Ok(Self {
            exe: daemon_executable()?,
        })
    }
}

/// Path of the running binary as it is named on disk now. After an upgrade
/// this is the replacement build, not the unlinked image we run from.
pub fn daemon_executable() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to resolve daemon executable")?;
    Ok(strip_deleted_suffix(&exe))
}

impl VersionSource for ExecutableVersionSource {
    fn installed_version(&self) -> Result<String> {
        let output = std::process::Command::new(&self.exe)
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {} --version", self.exe.display()))?;
        if !output.status.success() {
            anyhow::bail!("{} --version exited with {}", self.exe.display(), output.status);
        }
        parse_version_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Extracts the version from clap's `--version` line (`sessiond 0.1.0`).
pub fn parse_version_output(stdout: &str) -> Result<String> {
    stdout
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().last())
        .map(str::to_string)
        .context("Empty --version output")
}

/// Linux reports a replaced executable as `/path/to/bin (deleted)`.
pub(crate) fn strip_deleted_suffix(exe: &Path) -> PathBuf {
    let text = exe.to_string_lossy();
    match text.strip_suffix(" (deleted)") {
        Some(stripped) => PathBuf::from(stripped),
        None => exe.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_output() {
        assert_eq!(parse_version_output("sessiond 1.2.3\n").unwrap(), "1.2.3");
        assert_eq!(parse_version_output("1.2.3").unwrap(), "1.2.3");
        assert!(parse_version_output("").is_err());
    }

    #[test]
    fn test_strip_deleted_suffix() {
        assert_eq!(
            strip_deleted_suffix(Path::new("/usr/bin/sessiond (deleted)")),
            PathBuf::from("/usr/bin/sessiond")
        );
        assert_eq!(
            strip_deleted_suffix(Path::new("/usr/bin/sessiond")),
            PathBuf::from("/usr/bin/sessiond")
        );
    }

    #[test]
    fn test_cli_version_is_semver_like() {
        assert_eq!(CLI_VERSION.split('.').count(), 3);
    }
}
