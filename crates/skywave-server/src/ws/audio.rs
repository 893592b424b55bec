use crate::state::{binary_channel, AppState, AudioParams, AudioSession};
use axum::{
    extract::connect_info::ConnectInfo,
    extract::{ws, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use skywave_core::dsp::demod::DemodulationMode;
use skywave_core::dsp::noise_gate::GatePreset;
use skywave_core::pipeline::AudioPipeline;
use skywave_core::protocol::ClientCommand;
use skywave_core::util::generate_unique_id;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_CONTROL_MESSAGE_LEN: usize = 1024;
/// Rapid mode toggling races the PLL reset and encoder rebuild; changes
/// arriving faster than this are ignored.
const MODE_CHANGE_DEBOUNCE: Duration = Duration::from_millis(100);
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
    if state.registry.len() >= state.cfg.limits.audio {
        return (StatusCode::TOO_MANY_REQUESTS, "too many audio clients").into_response();
    }
    ws.on_upgrade(|socket| handle(socket, state, ip_guard))
}

enum AudioOutbound {
    Settings(String),
    Header(Vec<u8>),
}

fn mode_change_permitted(last: &mut Option<Instant>, now: Instant) -> bool {
    if let Some(prev) = *last {
        if now.duration_since(prev) < MODE_CHANGE_DEBOUNCE {
            return false;
        }
    }
    *last = Some(now);
    true
}

async fn handle(socket: ws::WebSocket, state: Arc<AppState>, _ip_guard: crate::state::WsIpGuard) {
    let client_id = state.alloc_client_id();
    tracing::info!(client_id, "audio ws connected");

    let rt = state.rt.clone();
    let pipeline = match AudioPipeline::new(
        rt.audio_max_sps as usize,
        rt.audio_max_fft_size,
        rt.is_real,
        rt.audio_compression.codec(),
        state.flac_mode,
    ) {
        Ok(p) => p,
        Err(e) => {
            // The only construction-time failure mode; this subscription is
            // rejected and the transport dropped.
            tracing::warn!(client_id, error = ?e, "audio pipeline init failed");
            return;
        }
    };
    let header_pkt = match pipeline.header_packet() {
        Ok(pkt) => pkt,
        Err(e) => {
            tracing::warn!(client_id, error = ?e, "failed to build audio header packet");
            return;
        }
    };

    let (default_mode, default_stereo) = DemodulationMode::parse(rt.default_mode_str.as_str())
        .unwrap_or((DemodulationMode::Usb, false));
    let unique_id = generate_unique_id();
    let (tx, mut audio_rx) = binary_channel();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<AudioOutbound>(8);

    let session = Arc::new(AudioSession {
        id: client_id,
        unique_id: unique_id.clone(),
        tx,
        params: std::sync::Mutex::new(AudioParams {
            l: rt.default_l,
            r: rt.default_r,
            m: rt.default_m,
            mode: default_mode,
            am_stereo: default_stereo,
            mute: false,
            agc_enabled: true,
            noise_gate_enabled: false,
            noise_gate_preset: GatePreset::Balanced,
            user_id: String::new(),
            last_mode_change: None,
        }),
        pipeline: std::sync::Mutex::new(pipeline),
        throttle: std::sync::Mutex::new(crate::throttle::ThrottleState::default()),
    });

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));
    let last_pong_tx = last_pong.clone();
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                biased;
                Some(cmd) = out_rx.recv() => {
                    match cmd {
                        AudioOutbound::Settings(json) => {
                            if ws_sender.send(ws::Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        AudioOutbound::Header(pkt) => {
                            // Drain packets from the previous stream before
                            // the new header goes out.
                            while audio_rx.try_recv().is_some() {}
                            if ws_sender.send(ws::Message::Binary(pkt)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(bytes) = audio_rx.recv() => {
                    if ws_sender.send(ws::Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    let stale = match last_pong_tx.lock() {
                        Ok(g) => g.elapsed() > PING_INTERVAL + PONG_TIMEOUT,
                        Err(_) => false,
                    };
                    if stale {
                        tracing::debug!("audio peer stopped answering pings");
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

    let basic_info = state.basic_info_json();
    if out_tx.send(AudioOutbound::Settings(basic_info)).await.is_err() {
        send_task.abort();
        return;
    }
    if let Some(pkt) = header_pkt {
        if out_tx.send(AudioOutbound::Header(pkt)).await.is_err() {
            send_task.abort();
            return;
        }
    }

    state.registry.insert(&session);
    state.broadcast_signal_changes(&unique_id, rt.default_l, rt.default_m, rt.default_r);

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            ws::Message::Text(txt) => {
                if txt.len() > MAX_CONTROL_MESSAGE_LEN {
                    continue;
                }
                let Ok(cmd) = serde_json::from_str::<ClientCommand>(&txt) else {
                    continue;
                };
                apply_command(&state, &session, cmd, &out_tx).await;
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

    state.registry.remove(&session);
    state.broadcast_signal_changes(&unique_id, -1, -1.0, -1);
    tracing::info!(client_id, %unique_id, "audio ws disconnected");
    send_task.abort();
}

async fn apply_command(
    state: &Arc<AppState>,
    session: &Arc<AudioSession>,
    cmd: ClientCommand,
    out_tx: &tokio::sync::mpsc::Sender<AudioOutbound>,
) {
    let rt = state.rt.as_ref();
    match cmd {
        ClientCommand::Window { l, r, m, level: _ } => {
            let Some(m) = m else { return };
            if l < 0 || r < 0 || l > r || r as usize >= rt.fft_result_size {
                return;
            }
            if (r - l) as usize > rt.audio_max_fft_size {
                return;
            }
            {
                let p = session.lock_params();
                if p.l == l && p.r == r && p.m == m {
                    // Same window twice is a no-op.
                    return;
                }
            }
            state.registry.rekey(session, l, r, m);
            state.broadcast_signal_changes(&session.unique_id, l, m, r);
        }
        ClientCommand::Demodulation { demodulation } => {
            let (was_stereo, accepted) = {
                let mut p = session.lock_params();
                let was = p.am_stereo;
                (was, mode_change_permitted(&mut p.last_mode_change, Instant::now()))
            };
            if !accepted {
                return;
            }
            let Some((mode, am_stereo)) = DemodulationMode::parse(demodulation.as_str()) else {
                return;
            };
            {
                let mut p = session.lock_params();
                p.mode = mode;
                p.am_stereo = am_stereo;
            }
            let header_to_send = {
                let mut pipeline = session.lock_pipeline();
                pipeline.apply_mode_change(mode, am_stereo);
                if am_stereo != was_stereo {
                    let channels = if am_stereo { 2 } else { 1 };
                    match pipeline.set_channels(channels) {
                        Ok(Some(header)) => Some(header),
                        Ok(None) => None,
                        Err(e) => {
                            tracing::warn!(
                                unique_id = %session.unique_id,
                                error = ?e,
                                "encoder channel reconfiguration failed"
                            );
                            None
                        }
                    }
                } else {
                    None
                }
            };
            if let Some(header) = header_to_send {
                let _ = out_tx.send(AudioOutbound::Header(header)).await;
            }
        }
        ClientCommand::Userid { userid } => {
            let mut userid = userid;
            userid.truncate(32);
            session.lock_params().user_id = userid;
        }
        ClientCommand::Mute { mute } => {
            session.lock_params().mute = mute;
        }
        ClientCommand::NoiseGateEnable { enabled } => {
            session.lock_params().noise_gate_enabled = enabled;
            session.lock_pipeline().set_noise_gate_enabled(enabled);
        }
        ClientCommand::NoiseGatePreset { preset } => {
            let Some(preset) = GatePreset::from_name(preset.as_str()) else {
                return;
            };
            session.lock_params().noise_gate_preset = preset;
            session.lock_pipeline().set_noise_gate_preset(preset);
        }
        ClientCommand::AgcEnable { enabled } => {
            session.lock_params().agc_enabled = enabled;
        }
        // Chat rides its own socket; ignore it here.
        ClientCommand::Chat { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::binary_channel;

    fn test_state() -> Arc<AppState> {
        let cfg: skywave_core::config::Config = serde_json::from_str(
            r#"{"input":{"sps":2400000,"frequency":0,"signal":"real","fft_size":131072}}"#,
        )
        .unwrap();
        let rt = cfg.runtime().unwrap();
        AppState::new(cfg, rt)
    }

    fn test_session(state: &Arc<AppState>) -> Arc<AudioSession> {
        let rt = state.rt.clone();
        let (tx, _rx) = binary_channel();
        let session = Arc::new(AudioSession {
            id: state.alloc_client_id(),
            unique_id: "test-session".to_string(),
            tx,
            params: std::sync::Mutex::new(AudioParams {
                l: rt.default_l,
                r: rt.default_r,
                m: rt.default_m,
                mode: DemodulationMode::Usb,
                am_stereo: false,
                mute: false,
                agc_enabled: true,
                noise_gate_enabled: false,
                noise_gate_preset: GatePreset::Balanced,
                user_id: String::new(),
                last_mode_change: None,
            }),
            pipeline: std::sync::Mutex::new(
                AudioPipeline::new(
                    rt.audio_max_sps as usize,
                    rt.audio_max_fft_size,
                    rt.is_real,
                    rt.audio_compression.codec(),
                    state.flac_mode,
                )
                .unwrap(),
            ),
            throttle: std::sync::Mutex::new(crate::throttle::ThrottleState::default()),
        });
        state.registry.insert(&session);
        session
    }

    #[tokio::test]
    async fn repeated_window_command_is_a_no_op() {
        let state = test_state();
        let session = test_session(&state);
        let (out_tx, _out_rx) = tokio::sync::mpsc::channel(8);

        let window = ClientCommand::Window {
            l: 100,
            r: 200,
            m: Some(150.0),
            level: None,
        };
        apply_command(&state, &session, window.clone(), &out_tx).await;
        {
            let p = session.lock_params();
            assert_eq!((p.l, p.r, p.m), (100, 200, 150.0));
        }
        assert!(!state.take_signal_changes().is_empty());

        // Second identical command: no rekey, no broadcast.
        apply_command(&state, &session, window, &out_tx).await;
        assert!(state.take_signal_changes().is_empty());

        // The registry key still matches the params.
        let snapshot = state.registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!((snapshot[0].0.l, snapshot[0].0.r), (100, 200));
    }

    #[tokio::test]
    async fn out_of_range_window_is_rejected() {
        let state = test_state();
        let session = test_session(&state);
        let (out_tx, _out_rx) = tokio::sync::mpsc::channel(8);
        let before = {
            let p = session.lock_params();
            (p.l, p.r)
        };

        // Window wider than the audio FFT.
        let too_wide = ClientCommand::Window {
            l: 0,
            r: state.rt.audio_max_fft_size as i32 + 100,
            m: Some(10.0),
            level: None,
        };
        apply_command(&state, &session, too_wide, &out_tx).await;
        // Reversed edges.
        let reversed = ClientCommand::Window {
            l: 200,
            r: 100,
            m: Some(150.0),
            level: None,
        };
        apply_command(&state, &session, reversed, &out_tx).await;

        let p = session.lock_params();
        assert_eq!((p.l, p.r), before, "invalid windows must not apply");
    }

    #[test]
    fn mode_change_debounce_rejects_rapid_toggles() {
        let t0 = Instant::now();
        let mut last = None;

        // AM accepted, FM 30 ms later rejected, FM after 150 ms accepted.
        assert!(mode_change_permitted(&mut last, t0));
        assert!(!mode_change_permitted(
            &mut last,
            t0 + Duration::from_millis(30)
        ));
        assert!(mode_change_permitted(
            &mut last,
            t0 + Duration::from_millis(150)
        ));
    }

    #[test]
    fn rejected_change_does_not_extend_the_window() {
        let t0 = Instant::now();
        let mut last = None;
        assert!(mode_change_permitted(&mut last, t0));
        // A rejected attempt at 90 ms must not push the window forward:
        // 110 ms after the *accepted* change is allowed.
        assert!(!mode_change_permitted(
            &mut last,
            t0 + Duration::from_millis(90)
        ));
        assert!(mode_change_permitted(
            &mut last,
            t0 + Duration::from_millis(110)
        ));
    }
}
