use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;

use crate::{
    events::BroadcastSink,
    ports::validate_range,
    session::ScanSession,
    types::{ScanConfig, ScanStatus, DEFAULT_BANNER_TIMEOUT},
};

const EVENT_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    session: ScanSession,
    events: BroadcastSink,
    timeout: Duration,
}

impl AppState {
    /// New state with a session already wired to a broadcast sink.
    pub fn new(timeout: Duration) -> Self {
        let events = BroadcastSink::new(EVENT_BUFFER);
        let session = ScanSession::with_timeout(timeout);
        session.startup(Arc::new(events.clone()));
        Self {
            session,
            events,
            timeout,
        }
    }

    pub fn session(&self) -> &ScanSession {
        &self.session
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusBody {
    pub status: ScanStatus,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub target: String,
    pub start_port: u32,
    pub end_port: u32,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub udp: bool,
}

fn default_max_threads() -> usize {
    100
}

/// API routes plus the static UI fallback.
pub fn router(state: AppState, ui_dir: impl Into<PathBuf>) -> Router {
    let api = Router::new()
        .route("/scan", post(post_scan))
        .route("/stop", post(post_stop))
        .route("/status", get(get_status))
        .route("/progress", get(get_progress))
        .route("/events", get(get_events))
        .with_state(state);

    let static_svc = ServeDir::new(ui_dir.into()).append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, ui_dir: PathBuf, timeout: Duration) -> Result<()> {
    let app = router(AppState::new(timeout), ui_dir);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving scan api");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(StatusBody {
        status: app.session.status(),
    })
}

async fn get_progress(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.session.progress())
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    match app.session.stop_scan() {
        Ok(()) => (
            StatusCode::OK,
            Json(StatusBody {
                status: app.session.status(),
            }),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> impl IntoResponse {
    let (start, end) = match validate_range(req.start_port, req.end_port) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let timeout = req.timeout_ms.map(Duration::from_millis).unwrap_or(app.timeout);
    let config = ScanConfig::new(req.target.trim(), start, end, req.max_threads)
        .with_timeout(timeout)
        .with_banner_timeout(DEFAULT_BANNER_TIMEOUT)
        .with_udp(req.udp);

    match app.session.start_scan_with(config) {
        Ok(()) => (StatusCode::ACCEPTED, Json(app.session.progress())).into_response(),
        Err(e) if e.is_preflight() => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Server-sent events: `event:` is the event name, `data:` its JSON payload.
async fn get_events(State(app): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(app.events.subscribe()).filter_map(|res| {
        // Lagged receivers skip what they missed.
        let ev = res.ok()?;
        Some(Ok(Event::default().event(ev.name).data(ev.payload.to_string())))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
