//! Control service exposed by the daemon on `127.0.0.1:<httpPort>`.

use crate::rpc::{
    DaemonInfo, DaemonResult, ReportOutcome, SessionMetadata, SessionSummary, ShutdownOrigin,
    SpawnRequest, SpawnResult,
};

#[tarpc::service]
pub trait ControlService {
    /// Start an agent session. Resolves once the agent reports its session
    /// id, or with an error after the correlation timeout.
    async fn spawn_session(request: SpawnRequest) -> SpawnResult;

    /// Stop a session by pid, `PID-<n>`, or session id.
    /// Returns false if nothing matched.
    async fn stop_session(id: String) -> bool;

    /// Ask the daemon to shut down.
    async fn request_shutdown(origin: ShutdownOrigin) -> DaemonResult<()>;

    /// Report-back from a spawned agent, keyed by `metadata.host_pid`.
    async fn report_session(
        session_id: String,
        metadata: SessionMetadata,
    ) -> DaemonResult<ReportOutcome>;

    /// Snapshot of all tracked sessions.
    async fn list_sessions() -> Vec<SessionSummary>;

    /// Identity of the running daemon.
    async fn status() -> DaemonInfo;
}
