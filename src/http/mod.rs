// growerd: Log & diagnostics HTTP server
//
// LAN-local, unauthenticated operator surface for a trusted network.
// Serves the log ring, a live SSE stream, the current pin snapshot and
// the emergency-stop trigger.

pub mod dashboard;
pub mod logbuf;

use std::convert::Infallible;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{Html, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::{ControlError, ControlResult};
use crate::gpio::RegistrySnapshot;
use crate::reconcile::ReconcilerHandle;
use crate::runtime_config::RuntimeConfig;

pub use logbuf::{LogBuffer, LogRecord, RingBufferLayer};

/// Records replayed to a freshly connected stream client.
const STREAM_BACKLOG: usize = 50;
const DEFAULT_LOG_COUNT: usize = 200;

#[derive(Clone)]
pub struct HttpState {
    pub logs: LogBuffer,
    pub registry: watch::Receiver<RegistrySnapshot>,
    pub recon: ReconcilerHandle,
    pub config: Arc<RuntimeConfig>,
    pub serial: String,
    pub started_at: Instant,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(get_dashboard))
        .route("/api/logs", get(get_logs))
        .route("/api/logs/stream", get(get_log_stream))
        .route("/api/health", get(get_health))
        .route("/api/gpio", get(get_gpio))
        .route("/api/emergency-stop", post(post_emergency_stop))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the diagnostics listener. Failing to bind is fatal at startup.
pub async fn bind(port: u16) -> ControlResult<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ControlError::FatalInit(format!("cannot bind log server port {port}: {e}")))
}

pub async fn serve(state: HttpState, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    info!(addr = %addr, ip = %local_ip(), "Log server started");

    let shutdown = async move {
        loop {
            if stop.changed().await.is_err() || *stop.borrow() {
                break;
            }
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "Log server error");
    }
    info!("Log server stopped");
}

// ─── Handlers ───────────────────────────────────────────────────────

async fn get_dashboard() -> Html<&'static str> {
    Html(dashboard::DASHBOARD_HTML)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    count: Option<usize>,
    level: Option<String>,
}

async fn get_logs(State(state): State<HttpState>, Query(query): Query<LogsQuery>) -> Json<Value> {
    let count = query.count.unwrap_or(DEFAULT_LOG_COUNT);
    let lines = state.logs.last(count, query.level.as_deref());
    Json(json!({
        "count": lines.len(),
        "total_buffered": state.logs.len(),
        "logs": lines,
    }))
}

async fn get_log_stream(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    // Initial burst of recent records, then the live feed. A client that
    // falls behind the broadcast queue gets its stream terminated instead
    // of ever back-pressuring producers.
    let backlog = state.logs.last(STREAM_BACKLOG, None);
    let live = BroadcastStream::new(state.logs.subscribe())
        .take_while(|res| futures::future::ready(res.is_ok()))
        .filter_map(|res| futures::future::ready(res.ok()));

    let stream = futures::stream::iter(backlog).chain(live).map(|record| {
        let data = serde_json::to_string(&record).unwrap_or_else(|_| "{}".into());
        Ok(SseEvent::default().data(data))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

async fn get_health(State(state): State<HttpState>) -> Json<Value> {
    let pins = state.registry.borrow().len();
    Json(json!({
        "status": "online",
        "hostname": hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into()),
        "ip": local_ip(),
        "serial": state.serial,
        "version": env!("CARGO_PKG_VERSION"),
        "gpio_pins": pins,
        "log_buffered": state.logs.len(),
        "uptime_s": state.started_at.elapsed().as_secs(),
        "intervals": state.config.all_intervals(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn get_gpio(State(state): State<HttpState>) -> Json<Value> {
    let snapshot = state.registry.borrow().clone();
    Json(json!({
        "pins": &*snapshot,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn post_emergency_stop(
    State(state): State<HttpState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let timeout = state.config.command_timeout();
    match state.recon.emergency_stop(timeout).await {
        Ok(()) => Ok(Json(json!({
            "status": "emergency_stop_executed",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))),
        Err(e) => {
            error!(error = %e, "Emergency stop via HTTP failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            ))
        }
    }
}

/// Best-effort local LAN address for display on the dashboard/health.
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".into())
}
