//! Connection handlers for Parley server.
//!
//! This module handles the WebSocket connection lifecycle: the token
//! handshake, the per-connection event loop and the heartbeat.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    outbound_channel, Collaborators, Connection, MemoryStore, Router as ChatRouter, TokenVerifier,
};
use parley_protocol::frames::ERROR_MALFORMED_FRAME;
use parley_protocol::{codec, ClientFrame, EventFrame, OutboundEvent, ServerFrame, WireFormat};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};

/// WebSocket close code for a rejected handshake.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The event router.
    pub router: ChatRouter,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Build state backed by the in-memory store, seeded from the config.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        config.seed.apply(&store);
        let tokens: Arc<dyn TokenVerifier> =
            Arc::new(JwtVerifier::new(config.auth.jwt_secret.as_bytes()));

        Self::with_collaborators(Collaborators::in_memory(store, tokens), config)
    }

    #[must_use]
    pub fn with_collaborators(collaborators: Collaborators, config: Config) -> Self {
        Self {
            router: ChatRouter::new(collaborators, config.limits.router_config()),
            config,
        }
    }
}

/// Handshake query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    #[serde(default)]
    pub format: WireFormat,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    version: &'static str,
    connections: usize,
    online_users: usize,
    rooms: usize,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.stats();
    axum::Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: stats.connection_count,
        online_users: stats.online_users,
        rooms: stats.room_count,
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = params.token.or_else(|| bearer_token(&headers));
    let format = params.format;

    ws.max_message_size(state.config.transport.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, token, format))
}

/// Extract the token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    token: Option<String>,
    format: WireFormat,
) {
    let (tx, mut outbound) = outbound_channel();

    let connection = match state.router.connect(token.as_deref(), tx).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "Handshake rejected");
            metrics::record_rejected_handshake();
            let close = Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHENTICATED,
                reason: "Unauthenticated".into(),
            }));
            if let Err(e) = socket.send(close).await {
                debug!(error = %e, "Failed to send close frame");
            }
            return;
        }
    };

    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(connection = %connection.id, user = %connection.user_id(), ?format, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat_ms = state.config.heartbeat.interval_ms;
    let connected = ServerFrame::connected(
        connection.id.clone(),
        connection.user_id().clone(),
        u32::try_from(heartbeat_ms).unwrap_or(u32::MAX),
    );
    if let Err(e) = send_frame(&mut sender, format, &connected).await {
        error!(connection = %connection.id, error = %e, "Failed to send Connected frame");
        state.router.disconnect(&connection);
        return;
    }

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let interval = Duration::from_millis(heartbeat_ms.max(1));
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Fan-out from other connections
            Some(event) = outbound.recv() => {
                if let Err(e) = send_event(&mut sender, format, &event).await {
                    debug!(connection = %connection.id, error = %e, "Outbound send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_frame(text.len(), "inbound");
                        let reply = match codec::decode_json::<ClientFrame>(&text) {
                            Ok(frame) => handle_frame(frame, &connection, &state).await,
                            Err(e) => malformed(&connection, &e),
                        };
                        if send_frame(&mut sender, format, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        if drain_binary(&mut read_buffer, &mut sender, format, &connection, &state)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection.id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection.id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection.id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if last_activity.elapsed() >= timeout {
                    debug!(connection = %connection.id, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
            }
        }
    }

    state.router.disconnect(&connection);
    metrics::set_active_rooms(state.router.stats().room_count);

    debug!(connection = %connection.id, "WebSocket disconnected");
}

/// Decode and handle every complete binary frame in `buffer`.
async fn drain_binary(
    buffer: &mut BytesMut,
    sender: &mut WsSender,
    format: WireFormat,
    connection: &Connection,
    state: &AppState,
) -> Result<()> {
    loop {
        let reply = match codec::decode_from::<ClientFrame>(buffer) {
            Ok(Some(frame)) => handle_frame(frame, connection, state).await,
            Ok(None) => return Ok(()),
            Err(e) => {
                // The stream cannot be resynchronized after a bad prefix.
                buffer.clear();
                malformed(connection, &e)
            }
        };
        send_frame(sender, format, &reply).await?;
    }
}

/// Handle one decoded client frame and produce the reply.
async fn handle_frame(frame: ClientFrame, connection: &Connection, state: &AppState) -> ServerFrame {
    match frame {
        ClientFrame::Request { id, event } => {
            let kind = event.name();
            let touches_rooms = matches!(
                event,
                parley_protocol::InboundEvent::JoinChannel(_)
                    | parley_protocol::InboundEvent::LeaveChannel(_)
            );
            let start = Instant::now();

            let ack = state.router.handle(connection, event).await;

            metrics::record_latency(start.elapsed().as_secs_f64());
            metrics::record_event(kind, ack.success);
            if touches_rooms {
                metrics::set_active_rooms(state.router.stats().room_count);
            }
            ServerFrame::ack(id, ack)
        }
        ClientFrame::Ping { timestamp } => ServerFrame::Pong { timestamp },
    }
}

fn malformed(connection: &Connection, error: &codec::ProtocolError) -> ServerFrame {
    warn!(connection = %connection.id, error = %error, "Malformed frame");
    metrics::record_error("malformed_frame");
    ServerFrame::error(ERROR_MALFORMED_FRAME, error.to_string())
}

/// Encode a frame in the connection's wire format.
fn encode_frame<T: Serialize>(format: WireFormat, frame: &T) -> Result<Message> {
    Ok(match format {
        WireFormat::Json => Message::Text(codec::encode_json(frame)?),
        WireFormat::Msgpack => Message::Binary(codec::encode(frame)?.to_vec()),
    })
}

/// Send a frame to the WebSocket.
async fn send_frame<T: Serialize>(sender: &mut WsSender, format: WireFormat, frame: &T) -> Result<()> {
    let message = encode_frame(format, frame)?;
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_frame(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

async fn send_event(sender: &mut WsSender, format: WireFormat, event: &OutboundEvent) -> Result<()> {
    send_frame(sender, format, &EventFrame { event }).await
}
