//! WebSocket endpoint and per-connection loops.

use crate::config::ConnectionConfig;
use crate::error::GatewayError;
use crate::gateway::{ConnectionState, GatewayHandler};
use crate::hub::ConnectionId;
use crate::metrics::{metrics_handler, MetricsService};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<GatewayHandler>,
    pub connection: ConnectionConfig,
}

/// Build the HTTP router: the upgrade endpoint, `/health`, and optionally
/// the Prometheus endpoint at `metrics.0`.
pub fn create_router(
    state: AppState,
    ws_path: &str,
    metrics: Option<(&str, MetricsService)>,
) -> Router {
    let mut router = Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler));

    if let Some((path, service)) = metrics {
        router = router.route(path, get(metrics_handler).with_state(service));
    }

    router
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.handler.hub().client_count(),
    }))
}

/// Upgrade handler; admission happens before the upgrade
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    // admission is keyed by address only; every connection has its own port
    let peer = peer.ip().to_string();
    if !state.handler.admit(&peer).await {
        return GatewayError::RateLimited.into_response();
    }

    let max_bytes = state.connection.max_message_bytes;
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, peer))
}

/// Drive one connection until the peer goes away, a deadline passes, or the
/// hub closes its queue.
async fn handle_socket(socket: WebSocket, state: AppState, peer: String) {
    let config = state.connection.clone();
    let hub = state.handler.hub().clone();
    let (sink, mut stream) = socket.split();

    let (tx, rx) = mpsc::channel::<Bytes>(config.outbound_queue);
    let conn_id = hub.next_connection_id();
    let mut conn = ConnectionState::new(conn_id, peer, tx);
    info!(conn_id, peer = %conn.peer(), "Connection opened");

    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        config.ping_interval(),
        config.write_timeout(),
        conn_id,
    ));
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = timeout(config.read_timeout(), stream.next()) => match frame {
                Err(_) => {
                    info!(conn_id, "Read deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(conn_id, error = %e, "Read error");
                    break;
                }
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => {
                        state.handler.handle_inbound(&mut conn, text.as_bytes()).await;
                    }
                    Message::Binary(data) => {
                        state.handler.handle_inbound(&mut conn, &data).await;
                    }
                    Message::Close(_) => break,
                    // any frame, pongs included, restarts the read deadline
                    Message::Ping(_) | Message::Pong(_) => {}
                },
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    if let Some(client_id) = conn.client_id() {
        hub.remove_if_current(client_id, conn_id);
    }
    drop(conn);

    // the queue is closed now; give the writer a chance to send a close frame
    if !writer_done && timeout(config.write_timeout(), &mut writer).await.is_err() {
        writer.abort();
    }
    info!(conn_id, "Connection closed");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    ping_every: Duration,
    write_timeout: Duration,
    conn_id: ConnectionId,
) {
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            next = outbound.recv() => match next {
                Some(payload) => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
                None => {
                    let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id, error = %e, "Write error");
                return;
            }
            Err(_) => {
                warn!(conn_id, "Write deadline exceeded");
                return;
            }
        }
    }
}
