//! Control surface: tarpc server for remote control and report-back.
//!
//! Remote operations are thin pass-throughs to the orchestrator, registry
//! and lifecycle. Binds to 127.0.0.1 only.

use crate::daemon::lifecycle::{Lifecycle, ShutdownSource};
use crate::daemon::registry::SharedRegistry;
use crate::daemon::spawn::SpawnOrchestrator;
use crate::daemon_log::daemon_log;
use crate::rpc::control_service::ControlService;
use crate::rpc::{
    DaemonError, DaemonInfo, DaemonResult, ReportOutcome, SessionMetadata, SessionSummary,
    ShutdownOrigin, SpawnRequest, SpawnResult,
};
use crate::version::{BUILD_SHA, CLI_VERSION};
use futures::StreamExt;
use std::sync::Arc;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::{broadcast, oneshot};

/// Identity reported by `status`.
#[derive(Debug, Clone)]
pub struct DaemonIdentity {
    pub pid: u32,
    pub start_time: String,
    pub http_port: u16,
}

#[derive(Clone)]
pub struct ControlServer {
    registry: SharedRegistry,
    orchestrator: Arc<SpawnOrchestrator>,
    lifecycle: Arc<Lifecycle>,
    identity: Arc<DaemonIdentity>,
}

impl ControlServer {
    pub fn new(
        registry: SharedRegistry,
        orchestrator: Arc<SpawnOrchestrator>,
        lifecycle: Arc<Lifecycle>,
        identity: DaemonIdentity,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            lifecycle,
            identity: Arc::new(identity),
        }
    }
}

impl ControlService for ControlServer {
    async fn spawn_session(self, _: tarpc::context::Context, request: SpawnRequest) -> SpawnResult {
        if !self.lifecycle.accepting_requests() {
            return SpawnResult::error(DaemonError::ShuttingDown.to_string());
        }
        self.orchestrator.spawn(request).await
    }

    async fn stop_session(self, _: tarpc::context::Context, id: String) -> bool {
        let stopped = self.registry.lock().await.stop(&id);
        daemon_log(
            "control",
            &format!(
                "Stop request for {}: {}",
                id,
                if stopped { "stopped" } else { "not found" }
            ),
        );
        stopped
    }

    /// Repeated requests are accepted and ignored; the first one wins.
    async fn request_shutdown(
        self,
        _: tarpc::context::Context,
        origin: ShutdownOrigin,
    ) -> DaemonResult<()> {
        let source = match origin {
            ShutdownOrigin::Remote => ShutdownSource::Remote,
            ShutdownOrigin::Cli => ShutdownSource::Cli,
        };
        self.lifecycle.request_shutdown(source);
        Ok(())
    }

    async fn report_session(
        self,
        _: tarpc::context::Context,
        session_id: String,
        metadata: SessionMetadata,
    ) -> DaemonResult<ReportOutcome> {
        let pid = metadata.host_pid;
        let outcome = self
            .registry
            .lock()
            .await
            .report_from_child(session_id.clone(), metadata)?;
        daemon_log(
            "control",
            &format!("Report from pid {} ({}): {:?}", pid, session_id, outcome),
        );
        Ok(outcome)
    }

    async fn list_sessions(self, _: tarpc::context::Context) -> Vec<SessionSummary> {
        self.registry.lock().await.all()
    }

    async fn status(self, _: tarpc::context::Context) -> DaemonInfo {
        DaemonInfo {
            pid: self.identity.pid,
            version: CLI_VERSION.to_string(),
            build_sha: BUILD_SHA.to_string(),
            start_time: self.identity.start_time.clone(),
            http_port: self.identity.http_port,
            session_count: self.registry.lock().await.session_count(),
        }
    }
}

/// Find an available TCP port.
pub async fn find_available_port() -> anyhow::Result<u16> {
    use tokio::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// Serves the control surface on `127.0.0.1:<port>` until `shutdown_tx`
/// fires. `ready` is signalled once the listener is bound.
pub async fn run_control_server(
    server: ControlServer,
    shutdown_tx: broadcast::Sender<()>,
    port: u16,
    ready: oneshot::Sender<()>,
) -> anyhow::Result<()> {
    use tarpc::serde_transport::tcp;

    let addr = format!("127.0.0.1:{}", port);
    let mut listener = tcp::listen(&addr, Bincode::default).await?;
    daemon_log("control", &format!("Control server listening on {}", addr));
    let _ = ready.send(());

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let channel = server::BaseChannel::with_defaults(transport);
                        let server = server.clone();
                        tokio::spawn(async move {
                            channel.execute(server.serve()).for_each(|response| async {
                                tokio::spawn(response);
                            }).await;
                        });
                    }
                    Err(e) => {
                        daemon_log("control", &format!("Accept error: {}", e));
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    daemon_log("control", "Control server stopped");
    Ok(())
}

#[cfg(test)]
#[path = "tests/control_tests.rs"]
mod tests;
