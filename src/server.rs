//! HTTP/websocket server: router, connection authentication, and the
//! per-connection event pump.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::auth::{authenticate, AuthedUser, TokenValidator};
use crate::config::MAX_WS_CONNECTIONS;
use crate::events::ClientEvent;
use crate::registry::SessionRegistry;
use crate::state::{shared, SharedState};
use crate::storage::Storage;
use crate::{clog, logging, presence, relay, signal};

/// Everything a request handler needs, cheap to clone per connection.
#[derive(Clone)]
pub struct ServerState {
    pub state: SharedState,
    pub registry: SessionRegistry,
    pub validator: TokenValidator,
    started_at: Instant,
    ws_connections: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ServerState {
    pub fn new(storage: Storage, token_secret: &str) -> Self {
        Self {
            state: shared(storage),
            registry: SessionRegistry::new(),
            validator: TokenValidator::new(token_secret),
            started_at: Instant::now(),
            ws_connections: Arc::new(AtomicUsize::new(0)),
            max_connections: MAX_WS_CONNECTIONS,
        }
    }

    /// Override the connection cap (defaults to the built-in limit).
    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.max_connections = limit;
        self
    }
}

/// Build the complete router.
pub fn build_router(server: ServerState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/ws", get(ws_handler))
        .with_state(server)
}

/// Build a standard JSON error response.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn stats_handler(State(server): State<ServerState>) -> impl IntoResponse {
    let queued = {
        let st = server.state.lock().await;
        st.storage.count_queued().unwrap_or(0)
    };
    Json(serde_json::json!({
        "uptime_secs": server.started_at.elapsed().as_secs(),
        "ws_connections": server.ws_connections.load(Ordering::Relaxed),
        "online_users": server.registry.online_user_count(),
        "queued_messages": queued,
    }))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Websocket upgrade. Authentication happens here, before the upgrade: a
/// bad, expired, or logged-out token means the handshake itself fails and
/// no connection joins the registry.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(server): State<ServerState>,
) -> Response {
    // Reserve a slot atomically before any await, so racing handshakes
    // cannot overshoot the cap. Every reject path below must release it.
    let reserved = server
        .ws_connections
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            (n < server.max_connections).then_some(n + 1)
        });
    if reserved.is_err() {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("too many connections (max {})", server.max_connections),
        );
    }

    let Some(token) = query.token else {
        server.ws_connections.fetch_sub(1, Ordering::Relaxed);
        return api_error(StatusCode::UNAUTHORIZED, "missing connection token");
    };

    let user = {
        let st = server.state.lock().await;
        match authenticate(&server.validator, &st.storage, &token) {
            Ok(user) => user,
            Err(e) => {
                clog!("ws: rejected connection: {e}");
                server.ws_connections.fetch_sub(1, Ordering::Relaxed);
                return api_error(StatusCode::UNAUTHORIZED, "authentication failed");
            }
        }
    };

    let slots = server.ws_connections.clone();
    ws.on_failed_upgrade(move |_| {
        slots.fetch_sub(1, Ordering::Relaxed);
    })
    .on_upgrade(move |socket| ws_connection(socket, server, user))
    .into_response()
}

async fn ws_connection(mut socket: WebSocket, server: ServerState, user: AuthedUser) {
    let joined = server.registry.join(&user.user_id);
    let mut rx = joined.rx;
    clog!(
        "ws: connected {} (conn {}, session {})",
        logging::user_id(&user.user_id),
        joined.conn_id,
        user.session_id
    );

    presence::connected(&server.state, &server.registry, &user.user_id, joined.now_reachable).await;
    relay::deliver_queued(&server.state, &server.registry, &user.user_id).await;

    loop {
        tokio::select! {
            // Fan-out from the user's channel to this socket
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(_) => continue,
                        };
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        clog!(
                            "ws: {} (conn {}) lagged, skipped {n} event(s)",
                            logging::user_id(&user.user_id),
                            joined.conn_id
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // Inbound events from the client
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let event = match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                clog!(
                                    "ws: ignoring unparseable frame from {}: {e}",
                                    logging::user_id(&user.user_id)
                                );
                                continue;
                            }
                        };
                        let replies = dispatch(&server, &user.user_id, event).await;
                        let mut closed = false;
                        for reply in replies {
                            let text = match serde_json::to_string(&reply) {
                                Ok(text) => text,
                                Err(_) => continue,
                            };
                            if socket.send(WsMessage::Text(text)).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }

    let now_unreachable = server.registry.leave(&user.user_id, joined.conn_id);
    presence::disconnected(&server.state, &server.registry, &user.user_id, now_unreachable).await;
    // Release the slot reserved at handshake time
    server.ws_connections.fetch_sub(1, Ordering::Relaxed);
    clog!(
        "ws: disconnected {} (conn {})",
        logging::user_id(&user.user_id),
        joined.conn_id
    );
}

/// Route one inbound event to its handler. Returns events addressed to the
/// originating connection (acks and errors); fan-out to other users goes
/// through the registry inside the handlers.
async fn dispatch(
    server: &ServerState,
    user_id: &str,
    event: ClientEvent,
) -> Vec<crate::events::ServerEvent> {
    match event {
        ClientEvent::SendMessage {
            receiver_id,
            message_uuid,
            message,
            message_type,
            timestamp,
        } => {
            relay::handle_send(
                &server.state,
                &server.registry,
                user_id,
                &receiver_id,
                &message_uuid,
                &message,
                &message_type,
                timestamp,
            )
            .await
        }
        ClientEvent::UpdateMessageStatus {
            message_uuid,
            status,
            sender_id,
        } => {
            relay::handle_status_update(&server.registry, user_id, &message_uuid, &status, &sender_id);
            Vec::new()
        }
        ClientEvent::TypingStart { receiver_id } => {
            signal::typing(&server.state, &server.registry, user_id, &receiver_id, true).await;
            Vec::new()
        }
        ClientEvent::TypingStop { receiver_id } => {
            signal::typing(&server.state, &server.registry, user_id, &receiver_id, false).await;
            Vec::new()
        }
        ClientEvent::FriendRequestSent {
            receiver_id,
            request_id,
        } => {
            signal::friend_request(&server.registry, user_id, &receiver_id, &request_id);
            Vec::new()
        }
    }
}
