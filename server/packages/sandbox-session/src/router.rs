use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use sandbox_session_error::{ErrorType, ProblemDetails, SessionError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::channel::WebSocketChannel;
use crate::codec::{ErrorEnvelope, ServerEnvelope, SessionEnvelope};
use crate::handler::RequestHandler;
use crate::lifecycle::{SessionConfig, SessionLifecycle};
use crate::provider::{LogOptions, ProviderError, SandboxId, SandboxProvider};
use crate::store::{ResultEntry, SessionRecord, SessionStatus, SessionStore, StoreError};

const SERVER_INFO: &str = "\
This is a sandbox session server. Available endpoints:\n\
  - GET  /                  - WebSocket session (or this text)\n\
  - GET  /v1/connect        - WebSocket session\n\
  - GET  /v1/health         - Health check\n\
  - GET  /v1/sessions       - Live sessions\n";

#[derive(Debug)]
pub struct AppState {
    store: Arc<SessionStore>,
    provider: Arc<dyn SandboxProvider>,
    handler: Arc<dyn RequestHandler>,
    session: SessionConfig,
    shutdown: watch::Sender<bool>,
    connections: Arc<ConnectionTracker>,
}

impl AppState {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        handler: Arc<dyn RequestHandler>,
        session: SessionConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store: Arc::new(SessionStore::new()),
            provider,
            handler,
            session,
            shutdown,
            connections: Arc::new(ConnectionTracker::default()),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connections whose session has not finished cleanup yet.
    pub fn active_connections(&self) -> usize {
        self.connections.active.load(Ordering::SeqCst)
    }

    fn lifecycle(&self) -> SessionLifecycle {
        SessionLifecycle::new(
            self.provider.clone(),
            self.store.clone(),
            self.handler.clone(),
            self.session.clone(),
        )
        .with_shutdown(self.shutdown.subscribe())
    }
}

#[derive(Debug, Default)]
struct ConnectionTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    fn enter(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/connect", get(connect))
        .route("/health", get(get_health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/logs", get(get_session_logs))
        .with_state(shared.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .with_state(shared.clone())
        .nest("/v1", v1_router)
        .fallback(not_found);

    let http_logging = match std::env::var("SANDBOX_SESSION_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Tells every active session to close. New connections are refused from
/// here on.
pub fn begin_shutdown(state: &AppState) {
    let active = state.active_connections();
    state.shutdown.send_replace(true);
    tracing::info!(active, "shutdown requested; closing sessions");
}

/// Waits for sessions to finish cleanup, up to `grace`. Returns `false` if
/// some were still running when the grace period ran out.
pub async fn drain_sessions(state: &AppState, grace: Duration) -> bool {
    let drained = async {
        tokio::join!(state.store.wait_empty(), state.connections.wait_idle());
    };
    match tokio::time::timeout(grace, drained).await {
        Ok(()) => {
            tracing::info!("all sessions cleaned up");
            true
        }
        Err(_) => {
            let remaining = state.store.list().await;
            let session_ids: Vec<&str> = remaining.iter().map(|record| record.session_id.as_str()).collect();
            tracing::warn!(
                active = state.active_connections(),
                ?session_ids,
                grace_secs = grace.as_secs(),
                "sessions still cleaning up after shutdown grace period"
            );
            false
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(connect, get_health, list_sessions, get_session, get_session_logs),
    components(
        schemas(
            HealthResponse,
            SessionListResponse,
            LogsResponse,
            SessionRecord,
            SessionStatus,
            ResultEntry,
            SandboxId,
            SessionEnvelope,
            ErrorEnvelope,
            ServerEnvelope,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Sandbox sessions")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8765")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        Self::Session(value.into())
    }
}

impl From<ProviderError> for ApiError {
    fn from(value: ProviderError) -> Self {
        Self::Session(value.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Session(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    pub session_id: SandboxId,
    pub content: String,
    pub lines: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

async fn get_root(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => accept_session(state, ws),
        None => SERVER_INFO.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/v1/connect",
    responses(
        (status = 101, description = "Upgraded to a WebSocket session; every frame sent back is a ServerEnvelope"),
        (status = 503, body = ProblemDetails, description = "Server is shutting down")
    ),
    tag = "sessions"
)]
async fn connect(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    accept_session(state, ws)
}

fn accept_session(state: Arc<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.is_shutting_down() {
        return ApiError::from(SessionError::ShuttingDown).into_response();
    }

    let lifecycle = state.lifecycle();
    let guard = state.connections.enter();
    ws.on_failed_upgrade(|err| {
        tracing::warn!(error = %err, "websocket upgrade failed");
    })
    .on_upgrade(move |socket: WebSocket| async move {
        let _guard = guard;
        lifecycle.run(WebSocketChannel::new(socket)).await;
    })
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.store.len().await,
    })
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses((status = 200, body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.store.list().await,
    })
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 200, body = SessionRecord),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id (sandbox id)")),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let record = state.store.get(&SandboxId::new(session_id)).await?;
    Ok(Json(record))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/logs",
    responses(
        (status = 200, body = LogsResponse),
        (status = 404, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    params(
        ("session_id" = String, Path, description = "Session id (sandbox id)"),
        ("tail" = Option<usize>, Query, description = "Only return the last N lines")
    ),
    tag = "sessions"
)]
async fn get_session_logs(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let session_id = SandboxId::new(session_id);
    // Only live sessions expose their sandbox.
    state.store.get(&session_id).await?;

    let options = LogOptions {
        follow: false,
        tail: query.tail,
    };
    let mut stream = state.provider.fetch_logs(&session_id, options).await?;
    let mut raw = Vec::new();
    while let Some(chunk) = stream.next().await {
        raw.extend_from_slice(&chunk?);
    }

    let content = String::from_utf8_lossy(&raw).into_owned();
    let lines = content.lines().count();
    Ok(Json(LogsResponse {
        session_id,
        content,
        lines,
    }))
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::from(SessionError::NotFound {
        message: format!("no route for {}", uri.path()),
    })
}
