//! Connection handlers for the danmu server.
//!
//! Each WebSocket connection attaches to the room named in its path and is
//! detached again however its task ends.

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use danmu_core::{
    Accepted, Collaborators, ConnectionId, MemorySessionCache, MemoryStore, Rejection, Relay,
    RoomId,
};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Close code sent when the connection id is already attached.
pub const CLOSE_CONNECTION_IN_USE: u16 = 4409;

/// Shared server state.
pub struct AppState {
    /// The danmu relay.
    pub relay: Relay,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let collaborators = Collaborators {
            verifier: Arc::new(JwtVerifier::new(&config.auth.jwt_secret)),
            identity: Arc::new(MemorySessionCache::with_principals(
                config.auth.principals.iter().cloned(),
            )),
            store: Arc::new(MemoryStore::new()),
        };

        Self {
            relay: Relay::with_config(collaborators, config.relay_config()),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket_route(), get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
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
    let route = config.websocket_route();
    let app = app(Arc::new(AppState::new(config)));

    let listener = TcpListener::bind(addr).await?;

    info!("Danmu server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, route);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.relay.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": stats.rooms,
        "connections": stats.connections,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((room, conn)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let (room_id, connection_id) = match (RoomId::parse(room), ConnectionId::parse(conn)) {
        (Ok(room_id), Ok(connection_id)) => (room_id, connection_id),
        (Err(reason), _) | (_, Err(reason)) => {
            debug!(reason, "Rejected upgrade");
            return (StatusCode::BAD_REQUEST, reason).into_response();
        }
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, room_id, connection_id))
        .into_response()
}

/// Detaches its connection when dropped.
struct Attachment {
    state: Arc<AppState>,
    room_id: RoomId,
    connection_id: ConnectionId,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let detached = self.state.relay.detach(&self.room_id, &self.connection_id);
        metrics::record_delivery(&detached.notice);
        metrics::set_active_rooms(self.state.relay.stats().rooms);
        debug!(
            room = %self.room_id,
            connection = %self.connection_id,
            viewers = detached.viewers,
            "WebSocket disconnected"
        );
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    room_id: RoomId,
    connection_id: ConnectionId,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut outbound = match state.relay.attach(&room_id, &connection_id) {
        Ok(attached) => {
            metrics::record_delivery(&attached.notice);
            attached.receiver
        }
        Err(e) => {
            warn!(room = %room_id, connection = %connection_id, error = %e, "Attach refused");
            let close = Message::Close(Some(CloseFrame {
                code: CLOSE_CONNECTION_IN_USE,
                reason: Cow::Owned(e.to_string()),
            }));
            let _ = socket.send(close).await;
            return;
        }
    };

    let _attachment = Attachment {
        state: Arc::clone(&state),
        room_id: room_id.clone(),
        connection_id: connection_id.clone(),
    };
    metrics::set_active_rooms(state.relay.stats().rooms);
    debug!(room = %room_id, connection = %connection_id, "WebSocket connected");

    let send_timeout = state.config.send_timeout();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            // Frames queued for this connection by the relay
            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    break;
                };
                match tokio::time::timeout(send_timeout, sender.send(Message::Text(payload.to_string()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "Send failed");
                        break;
                    }
                    Err(_) => {
                        warn!(connection = %connection_id, "Send timed out");
                        metrics::record_error("send_timeout");
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        let result = state.relay.on_payload(&room_id, &connection_id, &text).await;
                        record_outcome(start, result);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        let result = state.relay.on_binary_payload(&room_id, &connection_id, &data).await;
                        record_outcome(start, result);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
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
}

fn record_outcome(start: Instant, result: Result<Accepted, Rejection>) {
    match result {
        Ok(accepted) => metrics::record_accepted(&accepted.delivery),
        Err(rejection) => metrics::record_rejection(rejection.kind()),
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}
