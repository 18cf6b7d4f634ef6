//! Demonstration HTTP server with load shedding mounted
//!
//! Routes:
//! - `GET /health`      liveness, exempt from shedding by default
//! - `GET /shed/stats`  JSON [`ShedSnapshot`](crate::stats::ShedSnapshot)
//! - `GET /work?ms=N`   sleeps N milliseconds, a stand-in for real work
//! - `GET /metrics`     Prometheus text, with the `metrics` feature

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinError;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::middleware::with_load_shedding;
use crate::shed::LoadShedder;
use crate::{Error, Result};

/// Longest sleep `/work` will perform
const MAX_WORK: Duration = Duration::from_secs(10);

/// Shared application state
pub struct AppState {
    /// Admission control engine
    pub shedder: Arc<LoadShedder>,
    /// Prometheus exporter handle
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Create the router, with shedding wrapped around every route
pub fn create_router(state: Arc<AppState>) -> Router {
    let shedder = Arc::clone(&state.shedder);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/shed/stats", get(stats_handler))
        .route("/work", get(work_handler));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    with_load_shedding(router.with_state(state), shedder)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.shedder.snapshot())
}

#[derive(Debug, Deserialize)]
struct WorkParams {
    #[serde(default)]
    ms: u64,
}

async fn work_handler(Query(params): Query<WorkParams>) -> impl IntoResponse {
    let delay = Duration::from_millis(params.ms).min(MAX_WORK);
    tokio::time::sleep(delay).await;
    Json(json!({ "slept_ms": delay.as_millis() as u64 }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}

/// Load shedding demo server
pub struct Server {
    config: Config,
    shedder: Arc<LoadShedder>,
}

impl Server {
    /// Validate configuration and start background sampling
    ///
    /// # Errors
    ///
    /// Returns an error if any shedding option is invalid.
    pub fn new(config: Config) -> Result<Self> {
        let shedder = Arc::new(LoadShedder::from_config(&config.shedding)?);
        Ok(Self { config, shedder })
    }

    /// The engine this server mounts
    #[must_use]
    pub fn shedder(&self) -> &Arc<LoadShedder> {
        &self.shedder
    }

    /// Bind the configured address and serve until Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves, then drain
    ///
    /// In-flight requests get `server.drain_timeout` to finish. Connections
    /// still open after that are abandoned, so shutdown is always bounded.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        let state = Arc::new(AppState {
            shedder: Arc::clone(&self.shedder),
            #[cfg(feature = "metrics")]
            prometheus: install_prometheus(),
        });
        let app = create_router(state);

        info!("============================================================");
        info!("LOAD SHEDDER v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %local, "Listening");
        let aggregators = self.config.enabled_aggregators();
        if aggregators.is_empty() {
            warn!("No aggregators enabled - every request is accepted");
        } else {
            info!(aggregators = ?aggregators, "Shedding on");
        }
        info!("  GET http://{local}/shed/stats");
        info!("============================================================");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let graceful = async move {
            // A dropped sender also means stop
            let _ = stop_rx.wait_for(|stop| *stop).await;
        };
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
        });

        tokio::select! {
            result = &mut server => {
                warn!("Server exited before a shutdown signal");
                self.shedder.shutdown().await;
                return served(result);
            }
            () = signal => {}
        }

        let _ = stop_tx.send(true);
        let drain_timeout = self.config.server.drain_timeout;
        let inflight = self.shedder.inflight();
        info!(
            inflight = inflight.value(),
            timeout_ms = drain_timeout.as_millis() as u64,
            "Draining in-flight requests..."
        );

        let result = match tokio::time::timeout(drain_timeout, &mut server).await {
            Ok(result) => served(result),
            Err(_) => {
                warn!(
                    inflight = inflight.value(),
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "Drain timed out, abandoning open connections"
                );
                server.abort();
                Ok(())
            }
        };

        self.shedder.shutdown().await;
        result
    }
}

fn served(result: std::result::Result<std::io::Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(outcome) => outcome.map_err(Error::from),
        Err(e) => Err(Error::Internal(format!("Server task failed: {e}"))),
    }
}

#[cfg(feature = "metrics")]
fn install_prometheus() -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable, /metrics disabled");
            None
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
