use crate::state::{waterfall_channel, AppState, ClientId, WaterfallClient, WaterfallParams};
use axum::{
    extract::connect_info::ConnectInfo,
    extract::{ws, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use skywave_core::codec::zstd_stream::WaterfallStreamEncoder;
use skywave_core::protocol::ClientCommand;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_CONTROL_MESSAGE_LEN: usize = 1024;
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
    if state.total_waterfall_clients() >= state.cfg.limits.waterfall {
        return (StatusCode::TOO_MANY_REQUESTS, "too many waterfall clients").into_response();
    }
    ws.on_upgrade(|socket| handle(socket, state, ip_guard))
}

async fn handle(socket: ws::WebSocket, state: Arc<AppState>, _ip_guard: crate::state::WsIpGuard) {
    let client_id = state.alloc_client_id();
    tracing::info!(client_id, "waterfall ws connected");

    let encoder = match WaterfallStreamEncoder::new() {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(client_id, error = ?e, "waterfall encoder init failed");
            return;
        }
    };

    let rt = state.rt.clone();
    let initial_level = rt.downsample_levels - 1;
    let (tx, mut rx) = waterfall_channel();
    let client = Arc::new(WaterfallClient {
        tx,
        params: std::sync::Mutex::new(WaterfallParams {
            level: initial_level,
            l: 0,
            r: rt.min_waterfall_fft,
        }),
        throttle: std::sync::Mutex::new(crate::throttle::ThrottleState::default()),
    });

    let (mut ws_sender, mut ws_receiver) = socket.split();
    if ws_sender
        .send(ws::Message::Text(state.basic_info_json()))
        .await
        .is_err()
    {
        return;
    }

    let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));
    let last_pong_tx = last_pong.clone();
    let state_for_send = state.clone();
    let send_task = tokio::spawn(async move {
        let mut encoder = encoder;
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                biased;
                Some(job) = rx.recv() => {
                    let want_len = job.r.saturating_sub(job.l);
                    let Some(end) = job.quantized_offset.checked_add(want_len) else {
                        tracing::warn!(client_id, "waterfall job offset overflow; dropping");
                        continue;
                    };
                    let Some(data) = job.quantized.get(job.quantized_offset..end) else {
                        tracing::warn!(
                            client_id,
                            level = job.level,
                            l = job.l,
                            r = job.r,
                            buf_len = job.quantized.len(),
                            "waterfall job out of bounds; dropping"
                        );
                        continue;
                    };
                    let pkt = match encoder.encode_row(job.frame_num, job.level, job.l, job.r, data) {
                        Ok(pkt) => pkt,
                        Err(e) => {
                            tracing::warn!(client_id, error = ?e, "waterfall encode failed; dropping");
                            continue;
                        }
                    };

                    state_for_send
                        .total_waterfall_bits
                        .fetch_add(pkt.len() * 8, std::sync::atomic::Ordering::Relaxed);

                    if ws_sender.send(ws::Message::Binary(pkt)).await.is_err() {
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

    state.waterfall_clients[initial_level].insert(client_id, client.clone());

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            ws::Message::Text(txt) => {
                if txt.len() > MAX_CONTROL_MESSAGE_LEN {
                    continue;
                }
                let Ok(cmd) = serde_json::from_str::<ClientCommand>(&txt) else {
                    continue;
                };
                apply_command(&state, client_id, &client, cmd);
            }
            ws::Message::Pong(_) => {
                if let Ok(mut g) = last_pong.lock() {
                    *g = Instant::now();
                }
            }
            ws::Message::Close(_) => break,
            _ => {}
        }
    }

    let level = client.lock_params().level;
    state.waterfall_clients[level].remove(&client_id);
    tracing::info!(client_id, "waterfall ws disconnected");
    send_task.abort();
}

/// Window updates snap to the downsample level whose row length best fits
/// the requested span, then re-home the client onto that level's map.
fn apply_command(
    state: &Arc<AppState>,
    client_id: ClientId,
    client: &Arc<WaterfallClient>,
    cmd: ClientCommand,
) {
    let rt = state.rt.as_ref();
    let ClientCommand::Window { l, r, .. } = cmd else {
        return;
    };

    if l < 0 || r < 0 || l >= r {
        return;
    }

    let mut new_l = l;
    let mut new_r = r;

    let downsample_levels = rt.downsample_levels as i32;
    let mut new_level = downsample_levels - 1;
    let mut best_diff = (rt.min_waterfall_fft as i32) * 2;
    let mut lf = new_l as f32;
    let mut rf = new_r as f32;
    for i in 0..downsample_levels {
        let send_size = ((rf - lf) - (rt.min_waterfall_fft as f32)).abs();
        if send_size < (best_diff as f32) {
            best_diff = send_size as i32;
            new_level = i;
            new_l = lf.round() as i32;
            new_r = rf.round() as i32;
        }
        lf /= 2.0;
        rf /= 2.0;
    }

    if new_l < 0 || new_r <= new_l {
        return;
    }
    let new_level = new_level as usize;
    let new_l = new_l as usize;
    let new_r = new_r as usize;
    if new_r > (rt.fft_result_size >> new_level) {
        return;
    }

    let mut p = client.lock_params();
    if p.level != new_level {
        state.waterfall_clients[p.level].remove(&client_id);
        state.waterfall_clients[new_level].insert(client_id, client.clone());
    }
    p.level = new_level;
    p.l = new_l;
    p.r = new_r;
}
