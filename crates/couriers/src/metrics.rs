use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Serialize)]
struct Data<T> {
    data: T,
}

#[derive(Serialize)]
struct Status {
    status: &'static str,
}

/// Shared readiness flag. Flipped to not-ready when shutdown begins.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that starts out ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Set readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Current readiness.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct AppState {
    health: HealthState,
    prometheus: Option<PrometheusHandle>,
}

fn app(health: HealthState, prometheus: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(AppState { health, prometheus })
}

/// Install the Prometheus recorder and serve `/metrics`, `/healthz` and
/// `/ready` on `addr` until the task is dropped.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or binding fails.
pub async fn start_metrics_server(addr: SocketAddr, health: HealthState) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app(health, Some(handle))).await?;
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

async fn health_handler() -> Json<Data<Status>> {
    Json(Data {
        data: Status { status: "ok" },
    })
}

async fn ready_handler(State(state): State<AppState>) -> (StatusCode, Json<Data<Status>>) {
    if state.health.is_ready() {
        (
            StatusCode::OK,
            Json(Data {
                data: Status { status: "ready" },
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Data {
                data: Status {
                    status: "shutting down",
                },
            }),
        )
    }
}

/// Connection and queue gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("courier_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("courier_connections_active").decrement(1.0);
    }

    /// Set the number of messages waiting in the route queue.
    #[allow(clippy::cast_precision_loss)]
    pub fn route_queue_depth(depth: usize) {
        metrics::gauge!("courier_route_queue_depth").set(depth as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a handshake authentication outcome.
    pub fn auth_total(status: &'static str) {
        metrics::counter!("courier_auth_total", "status" => status).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("courier_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("courier_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record why a session ended.
    pub fn sessions_closed_total(reason: &'static str) {
        metrics::counter!("courier_sessions_closed_total", "reason" => reason).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Time from enqueue to successful write, in seconds.
    pub fn delivery_latency_seconds(value: f64) {
        metrics::histogram!("courier_delivery_latency_seconds").record(value);
    }
}
