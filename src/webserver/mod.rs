use std::net::SocketAddr;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::errors::tracked_err;
use crate::errors::Reraise;
use crate::errors::Result;
use crate::identity::BodyId;
use crate::metrics::render_prometheus;
use crate::monitor::FutureMonitor;
use crate::monitor::MonitoredBody;
use crate::recovery::BodyState;
use crate::recovery::RecoveryCoordinator;

#[derive(Clone)]
pub(crate) struct ApiState {
    pub(crate) monitor: Arc<FutureMonitor>,
    pub(crate) coordinator: Arc<RecoveryCoordinator>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SupervisedBody {
    body: BodyId,
    state: BodyState,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusReport {
    monitoring_enabled: bool,
    monitored: Vec<MonitoredBody>,
    supervised: Vec<SupervisedBody>,
    workers: usize,
    max_workers: usize,
}

impl StatusReport {
    pub(crate) fn collect(state: &ApiState) -> Self {
        let pool = state.coordinator.pool();
        Self {
            monitoring_enabled: state.monitor.config().interval.is_some(),
            monitored: state.monitor.registry().snapshot(),
            supervised: state
                .coordinator
                .states_snapshot()
                .into_iter()
                .map(|(body, state)| SupervisedBody { body, state })
                .collect(),
            workers: pool.size(),
            max_workers: pool.capacity(),
        }
    }
}

async fn get_status(Extension(state): Extension<ApiState>) -> impl IntoResponse {
    Json(StatusReport::collect(&state))
}

async fn get_metrics() -> Response {
    match render_prometheus() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn run_webserver(listener: TcpListener, state: ApiState) -> Result<()> {
    let app = Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .layer(Extension(state));

    axum::Server::from_tcp(listener)
        .map_err(|err| tracked_err(&format!("unable to start diagnostics API: {err}")))?
        .serve(app.into_make_service())
        .await
        .map_err(|err| tracked_err(&format!("diagnostics API failed: {err}")))
}

/// Diagnostics API running on its own tokio runtime.
///
/// Keep it around for as long as the API should be served.
pub struct ApiServer {
    rt: Runtime,
    addr: SocketAddr,
}

impl ApiServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        // If we just drop the runtime, it will wait indefinitely
        // that the server stops, so we need to stop it manually.
        self.rt.shutdown_timeout(Duration::from_secs(0));
    }
}

/// Start the tokio runtime for the webserver and bind `0.0.0.0:port`.
pub(crate) fn start_server_runtime(state: ApiState, port: u16) -> Result<ApiServer> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .reraise(&format!("unable to bind diagnostics API to port {port}"))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("vigil-webserver")
        .enable_all()
        .build()
        .reraise("error initializing tokio runtime for webserver")?;
    tracing::info!("Starting diagnostics API server on {addr:?}");
    rt.spawn(async move {
        if let Err(err) = run_webserver(listener, state).await {
            tracing::error!("{err}");
        }
    });
    Ok(ApiServer { rt, addr })
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::io::Write;
    use std::net::TcpStream;

    use super::*;
    use crate::identity::HostRef;
    use crate::identity::NodeUrl;
    use crate::monitor::Heartbeat;
    use crate::monitor::MonitorConfig;
    use crate::recovery::Checkpoint;
    use crate::recovery::HashedTargets;
    use crate::recovery::InMemCheckpointStore;
    use crate::recovery::InMemLocations;
    use crate::recovery::Incarnation;
    use crate::FutureReply;

    fn state() -> ApiState {
        let monitor = FutureMonitor::new(
            Arc::new(|_: &BodyId| -> std::io::Result<Heartbeat> { Ok(Heartbeat::Alive) }),
            MonitorConfig {
                interval: None,
                fault_tolerance: false,
            },
        );
        let endpoint = |_: &HostRef, _: &Checkpoint, _: Incarnation| -> Result<()> { Ok(()) };
        let coordinator = RecoveryCoordinator::new(
            3,
            Arc::new(InMemCheckpointStore::new()),
            Arc::new(HashedTargets::new(vec![])),
            Arc::new(endpoint),
            Arc::new(InMemLocations::new()),
        );
        ApiState {
            monitor: Arc::new(monitor),
            coordinator: Arc::new(coordinator),
        }
    }

    fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn status_report_lists_everything() {
        let state = state();
        let pending = FutureReply::<u8>::new(BodyId::from("m"), NodeUrl::from("tcp://h1:1099"));
        state.monitor.monitor(&pending);
        state.coordinator.register(BodyId::from("s")).unwrap();

        let report = StatusReport::collect(&state);
        assert!(!report.monitoring_enabled);
        assert_eq!(report.monitored.len(), 1);
        assert_eq!(report.monitored[0].pending, 1);
        assert_eq!(report.supervised.len(), 1);
        assert_eq!(report.supervised[0].state, BodyState::Running);
        assert_eq!(report.workers, 1);
        assert_eq!(report.max_workers, 3);
    }

    #[test]
    fn serves_status_and_metrics() {
        let state = state();
        state.coordinator.register(BodyId::from("s")).unwrap();
        let server = start_server_runtime(state, 0).unwrap();

        let status = http_get(server.local_addr(), "/status");
        assert!(status.starts_with("HTTP/1.1 200"), "{status}");
        assert!(status.contains(r#""supervised":[{"body":"s","state":"Running"}]"#));

        let metrics = http_get(server.local_addr(), "/metrics");
        assert!(metrics.starts_with("HTTP/1.1 200"), "{metrics}");

        let missing = http_get(server.local_addr(), "/nope");
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");
        server.shutdown();
    }
}
