use crate::state::AppState;
use axum::{
    extract::connect_info::ConnectInfo,
    extract::{ws, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PING_INTERVAL: Duration = Duration::from_secs(25);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    let Some(ip_guard) = state.try_acquire_ws_ip(addr.ip()) else {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "too many connections from this IP",
        )
            .into_response();
    };
    if state.event_clients.len() >= state.cfg.limits.events {
        return (StatusCode::TOO_MANY_REQUESTS, "too many events clients").into_response();
    }
    ws.on_upgrade(|socket| handle(socket, state, ip_guard))
}

async fn handle(socket: ws::WebSocket, state: Arc<AppState>, _ip_guard: crate::state::WsIpGuard) {
    let client_id = state.alloc_client_id();
    tracing::info!(client_id, "events ws connected");
    let (tx, mut rx) = crate::state::text_channel();
    state.event_clients.insert(client_id, tx);

    // New clients get a full snapshot of everyone's tuning up front.
    let initial = state.event_info(Some(state.snapshot_signal_changes()));
    let initial_json = match serde_json::to_string(&initial) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(client_id, error = ?e, "failed to serialize initial events payload");
            "{}".to_string()
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();
    if ws_sender
        .send(ws::Message::Text(initial_json))
        .await
        .is_err()
    {
        state.event_clients.remove(&client_id);
        return;
    }

    let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));
    let last_pong_tx = last_pong.clone();
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if ws_sender
                        .send(ws::Message::Text(msg.as_ref().to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = ping.tick() => {
                    let stale = match last_pong_tx.lock() {
                        Ok(g) => g.elapsed() > PING_INTERVAL + PONG_TIMEOUT,
                        Err(_) => false,
                    };
                    if stale {
                        break;
                    }
                    if ws_sender.send(ws::Message::Ping(b"k".to_vec())).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            ws::Message::Pong(_) => {
                if let Ok(mut g) = last_pong.lock() {
                    *g = Instant::now();
                }
            }
            ws::Message::Close(_) => break,
            _ => {}
        }
    }

    state.event_clients.remove(&client_id);
    tracing::info!(client_id, "events ws disconnected");
    send_task.abort();
}

/// 1 Hz telemetry tick: refreshes the kbit/s gauges, drains the queued
/// signal changes and fans the payload out to every events client.
pub async fn run_ticker(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        state.update_kbits_gauges();

        let changes = state.take_signal_changes();
        let changes = if changes.is_empty() { None } else { Some(changes) };
        let info = state.event_info(changes);
        let json = match serde_json::to_string(&info) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = ?e, "failed to serialize events payload");
                continue;
            }
        };

        let msg: Arc<str> = Arc::from(json);
        let mut dead = Vec::new();
        for entry in state.event_clients.iter() {
            if entry.value().try_send(msg.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            state.event_clients.remove(&id);
        }
    }
}
