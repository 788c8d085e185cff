//! Process-control seam: signals, liveness, exit and our own pid.
//!
//! Everything that touches OS processes by pid goes through `ProcessControl`
//! so the registry, health loop and shutdown sequence can be driven against
//! a fake in tests.

use anyhow::Result;

/// Signals the daemon sends to agent processes and peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Polite termination request (SIGTERM).
    Terminate,
    /// Forced kill (SIGKILL).
    Kill,
}

pub trait ProcessControl: Send + Sync {
    fn self_pid(&self) -> u32;

    /// Zero-effect liveness check (signal 0).
    fn is_alive(&self, pid: u32) -> bool;

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()>;

    /// Terminates the current process. Real implementations never return.
    fn exit(&self, code: i32);
}

/// The real operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcess;

impl ProcessControl for SystemProcess {
    fn self_pid(&self) -> u32 {
        std::process::id()
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        use anyhow::Context;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).context("pid out of range")?;
        if raw <= 0 {
            anyhow::bail!("refusing to signal pid {}", pid);
        }
        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        kill(Pid::from_raw(raw), sig)
            .with_context(|| format!("Failed to send {:?} to pid {}", sig, pid))
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, _signal: StopSignal) -> Result<()> {
        anyhow::bail!("signalling pid {} is only supported on unix", pid)
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_is_alive() {
        let process = SystemProcess;
        assert!(process.is_alive(process.self_pid()));
    }

    #[test]
    fn test_pid_zero_is_never_alive() {
        assert!(!SystemProcess.is_alive(0));
        assert!(SystemProcess.signal(0, StopSignal::Terminate).is_err());
    }

    #[tokio::test]
    async fn test_exited_child_is_not_alive() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(!SystemProcess.is_alive(pid));
    }
}
