//! Connection handlers for the Tandem server.
//!
//! This module handles admission, the per-connection loop and teardown for
//! both WebSocket endpoints.

use crate::auth;
use crate::call_log::TracingCallLog;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{
    AuthError, CallLog, ContactDirectory, Dispatch, Outbound, PrincipalLookup, Switchboard,
    TokenValidator,
};
use tandem_protocol::ClientIdentity;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Which endpoint a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Contact presence and addressed signaling.
    Direct,
    /// Anonymous random pairing.
    Random,
}

impl Endpoint {
    /// Metric label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Direct => "direct",
            Endpoint::Random => "random",
        }
    }
}

/// Why an upgrade request was refused.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The token did not resolve to an identity.
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    /// The server is at its connection limit.
    #[error("Connection limit reached")]
    AtCapacity,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            AdmissionError::Unauthorized(AuthError::Directory(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "directory_unavailable")
            }
            AdmissionError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AdmissionError::AtCapacity => (StatusCode::SERVICE_UNAVAILABLE, "at_capacity"),
        };
        metrics::record_rejection(reason);
        (status, self.to_string()).into_response()
    }
}

/// Shared server state.
pub struct AppState {
    /// The relay.
    pub switchboard: Arc<Switchboard>,
    /// Resolves `authToken` values.
    pub validator: Arc<dyn TokenValidator>,
    /// Server configuration.
    pub config: Config,
    active: Arc<AtomicUsize>,
}

impl AppState {
    /// Create app state with collaborators built from `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let directory = Arc::new(config.directory());
        let principals: Arc<dyn PrincipalLookup> = directory.clone();
        let validator = auth::validator_from_config(&config.auth, principals);
        Self::with_collaborators(config, validator, directory, Arc::new(TracingCallLog::new()))
    }

    /// Create app state over the given collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: Config,
        validator: Arc<dyn TokenValidator>,
        directory: Arc<dyn ContactDirectory>,
        call_log: Arc<dyn CallLog>,
    ) -> Self {
        let switchboard = Switchboard::new(config.switchboard(), directory, call_log);
        Self {
            switchboard: Arc::new(switchboard),
            validator,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of admitted connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    async fn admit(&self, token: Option<&str>) -> Result<(ClientIdentity, ActiveSlot), AdmissionError> {
        let identity = self.validator.resolve(token.unwrap_or_default()).await?;
        let slot = ActiveSlot::acquire(&self.active, self.config.limits.max_connections)
            .ok_or(AdmissionError::AtCapacity)?;
        Ok((identity, slot))
    }
}

/// One admitted connection's share of the connection limit.
struct ActiveSlot {
    active: Arc<AtomicUsize>,
}

impl ActiveSlot {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
            })
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Query string of an upgrade request.
#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    /// Bearer token.
    #[serde(rename = "authToken")]
    pub auth_token: Option<String>,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.direct_path, get(direct_handler))
        .route(&state.config.transport.random_path, get(random_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config));
    let listener = TcpListener::bind(addr).await?;

    info!("Tandem server listening on {}", addr);
    info!(
        "WebSocket endpoints: ws://{}{} and ws://{}{}",
        addr, state.config.transport.direct_path, addr, state.config.transport.random_path
    );

    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves.
///
/// Runs the keep-alive reaper for the lifetime of the server when a
/// heartbeat timeout is configured.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reap_interval = Duration::from_millis(state.config.heartbeat.reap_interval_ms.max(1));
    let reaper = state.switchboard.keepalive().spawn_reaper(reap_interval);

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    info!("Server stopped");
    result.map_err(Into::into)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.switchboard.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online": stats.online,
        "waiting": stats.waiting,
        "sessions": stats.sessions,
        "connections": state.active_connections(),
        "heartbeat_interval_ms": state.config.heartbeat.interval_ms,
    }))
}

async fn direct_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<AuthQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(ws, query, state, Endpoint::Direct).await
}

async fn random_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<AuthQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(ws, query, state, Endpoint::Random).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    query: AuthQuery,
    state: Arc<AppState>,
    endpoint: Endpoint,
) -> Response {
    let (identity, slot) = match state.admit(query.auth_token.as_deref()).await {
        Ok(admitted) => admitted,
        Err(e) => {
            debug!(endpoint = endpoint.as_str(), error = %e, "Upgrade refused");
            return e.into_response();
        }
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, identity, endpoint, slot))
}

/// Handle an admitted WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: ClientIdentity,
    endpoint: Endpoint,
    _slot: ActiveSlot,
) {
    let _metrics_guard = ConnectionMetricsGuard::new(endpoint.as_str());
    let switchboard = &state.switchboard;

    let (handle, mut outbound) = match endpoint {
        Endpoint::Direct => switchboard.open_direct(identity).await,
        Endpoint::Random => {
            let (handle, rx, outcome) = switchboard.open_random(identity);
            debug!(connection = %handle.id(), ?outcome, "Joined random pool");
            (handle, rx)
        }
    };
    let connection_id = handle.id();
    metrics::set_switchboard_stats(&switchboard.stats());
    debug!(connection = %connection_id, identity = %identity, endpoint = endpoint.as_str(), "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            item = outbound.recv() => {
                match item {
                    Some(Outbound::Text(text)) => {
                        metrics::record_outbound(text.len());
                        if sender.send(Message::Text(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        let frame = CloseFrame {
                            code: close_code::AWAY,
                            reason: reason.as_str().into(),
                        };
                        if let Err(e) = sender.send(Message::Close(Some(frame))).await {
                            debug!(connection = %connection_id, error = %e, "Close frame not sent");
                        }
                        break;
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        let dispatch = match endpoint {
                            Endpoint::Direct => switchboard.handle_direct(&handle, &text),
                            Endpoint::Random => switchboard.handle_random(&handle, &text),
                        };
                        if let Dispatch::Forwarded(delivery) = dispatch {
                            debug!(connection = %connection_id, ?delivery, "Relayed");
                        }
                        metrics::record_dispatch(text.len(), &dispatch);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        switchboard.keepalive().touch(connection_id);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        switchboard.keepalive().touch(connection_id);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!(connection = %connection_id, len = data.len(), "Discarding binary message");
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    match endpoint {
        Endpoint::Direct => {
            if !switchboard.close_direct(&handle).await {
                debug!(connection = %connection_id, "Superseded by a newer connection");
            }
        }
        Endpoint::Random => {
            let outcome = switchboard.close_random(&handle);
            debug!(connection = %connection_id, ?outcome, "Left random pool");
        }
    }
    metrics::set_switchboard_stats(&switchboard.stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}
