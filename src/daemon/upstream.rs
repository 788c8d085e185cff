//! Status transitions pushed to the remote sync client.
//!
//! The sync transport is an external collaborator. The daemon only needs to
//! tell it about coarse state changes, always best-effort and time-bounded.

use crate::daemon_log::daemon_log;
use anyhow::Result;
use std::time::Duration;

/// Coarse daemon state as seen by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: u32, http_port: u16 },
    ShuttingDown { source: String },
}

#[async_trait::async_trait]
pub trait UpstreamSync: Send + Sync {
    async fn push_status(&self, status: DaemonStatus) -> Result<()>;
}

/// Records transitions in the daemon log. Used when no sync client is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyUpstream;

#[async_trait::async_trait]
impl UpstreamSync for LogOnlyUpstream {
    async fn push_status(&self, status: DaemonStatus) -> Result<()> {
        daemon_log("upstream", &format!("Status: {:?}", status));
        Ok(())
    }
}

/// Pushes `status`, giving up after `limit`. Never fails.
pub async fn push_bounded(upstream: &dyn UpstreamSync, status: DaemonStatus, limit: Duration) {
    match tokio::time::timeout(limit, upstream.push_status(status)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => daemon_log("upstream", &format!("Status push failed: {:#}", e)),
        Err(_) => daemon_log(
            "upstream",
            &format!("Status push timed out after {}ms", limit.as_millis()),
        ),
    }
}
