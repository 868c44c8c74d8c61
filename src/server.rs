//! HTTP + SSE transport for the MCP protocol.
//!
//! Endpoints:
//!   GET  /health   - liveness, never authenticated
//!   GET  /sse      - event stream carrying every JSON-RPC response and
//!                    notification
//!   POST /message  - one JSON-RPC message; answered with 202, the actual
//!                    response travels over the event stream

use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::mcp::{McpProtocol, RpcError, SERVER_NAME};

pub const MESSAGE_PATH: &str = "/message";

const RESPONSE_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    protocol: Arc<McpProtocol>,
    responses: broadcast::Sender<String>,
    auth_token: Option<Arc<str>>,
    shutdown: CancellationToken,
}

impl AppState {
    /// `auth_token` is ignored when blank.
    pub fn new(protocol: Arc<McpProtocol>, auth_token: &str) -> Self {
        let (responses, _) = broadcast::channel(RESPONSE_CAPACITY);
        let token = auth_token.trim();
        Self {
            protocol,
            responses,
            auth_token: (!token.is_empty()).then(|| Arc::from(token)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled when the server shuts down; open event streams end with it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut mcp = Router::new()
        .route("/sse", get(sse_stream))
        .route(MESSAGE_PATH, post(post_message));
    if state.auth_token.is_some() {
        mcp = mcp.route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));
    }

    Router::new()
        .route("/health", get(health))
        .merge(mcp)
        .with_state(state)
}

// ==================== HANDLERS ====================

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server": SERVER_NAME,
        "tools": "available",
    }))
}

async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(req).await;
    };
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    if presented != Some(expected) {
        debug!(path = %req.uri().path(), "rejected unauthenticated request");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "unauthorized",
                "message": "Invalid or missing bearer token. Provide a valid token in the Authorization header.",
            })),
        )
            .into_response();
    }
    next.run(req).await
}

/// Token of a `Bearer` authorization value. The scheme is case-insensitive.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
}

/// Logs the disconnect when the event stream is dropped.
struct ConnectionGuard;

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        info!("SSE client disconnected");
    }
}

async fn sse_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    info!("SSE client connected");

    // Subscribe before returning so nothing published after connect is missed.
    let responses = BroadcastStream::new(state.responses.subscribe());
    let notifications = BroadcastStream::new(state.protocol.notifications())
        .map(|item| item.map(|value| value.to_string()));

    let guard = ConnectionGuard;
    let messages = responses.merge(notifications).filter_map(move |item| {
        let _connected = &guard;
        match item {
            Ok(data) => {
                debug!(len = data.len(), "SSE sending message");
                Some(Ok(SseEvent::default().event("message").data(data)))
            }
            Err(lagged) => {
                debug!("SSE client lagging: {lagged}");
                None
            }
        }
    });

    let endpoint = tokio_stream::once(Ok(SseEvent::default().event("endpoint").data(MESSAGE_PATH)));
    let stream = futures::StreamExt::take_until(
        endpoint.chain(messages),
        state.shutdown.clone().cancelled_owned(),
    );

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}

async fn post_message(State(state): State<AppState>, body: String) -> Response {
    debug!(len = body.len(), "received message");

    let message = match serde_json::from_str::<Value>(&body) {
        Ok(message @ Value::Object(_)) => message,
        Ok(_) => {
            return bad_request(RpcError::invalid_request(
                "expected a JSON-RPC request object",
            ))
        }
        Err(e) => return bad_request(RpcError::parse_error(e.to_string())),
    };

    if let Some(response) = state.protocol.handle_message(message).await {
        // No open stream means nobody to deliver to.
        if state.responses.send(response.to_string()).is_err() {
            debug!("response dropped: no SSE client connected");
        }
    }

    StatusCode::ACCEPTED.into_response()
}

fn bad_request(error: RpcError) -> Response {
    error!(code = error.code, "error processing message: {}", error.message);
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": error.message, "code": error.code })),
    )
        .into_response()
}

// ==================== SERVER ====================

pub struct McpServer {
    state: AppState,
    addr: SocketAddr,
}

impl McpServer {
    pub fn new(protocol: Arc<McpProtocol>, config: &ServerConfig) -> Self {
        let host = if config.localhost_only {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        Self {
            state: AppState::new(protocol, &config.auth_token),
            addr: SocketAddr::new(host, config.port),
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        info!(addr = %self.addr, auth = self.state.auth_token.is_some(), "MCP server listening");

        let streams = self.state.shutdown_token();
        let app = build_router(self.state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                streams.cancel();
            })
            .await
            .context("server error")?;

        info!("MCP server stopped");
        Ok(())
    }
}
