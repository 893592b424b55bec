//! Per-frame fan-out from the spectrum producer to the subscribers.
//!
//! One controller task consumes published frames. For every audio
//! subscription that passes adaptive throttling it submits an independent
//! worker task, then awaits all of them before touching the next frame: the
//! overlap-add carry inside each pipeline requires that a subscription is
//! never serviced by two frames concurrently. This barrier is a known
//! head-of-line serialization point behind the slowest subscriber.

use crate::state::{AppState, AudioSession, SendOutcome, WaterfallJob};
use crate::throttle::StreamKind;
use bytes::Bytes;
use num_complex::Complex32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Read-only frequency-domain frame published by the external FFT producer.
/// Complex (IQ) inputs are rotated at publish time, so bin `i` is spectrum
/// position `i` for every consumer.
#[derive(Clone)]
pub struct SpectrumFrame {
    pub frame_num: u64,
    pub bins: Arc<[Complex32]>,
}

pub async fn run_audio(state: Arc<AppState>, mut frames: mpsc::Receiver<SpectrumFrame>) {
    while let Some(frame) = frames.recv().await {
        dispatch_audio_frame(&state, &frame).await;
    }
    tracing::info!("spectrum input ended; audio dispatcher stopping");
}

async fn dispatch_audio_frame(state: &Arc<AppState>, frame: &SpectrumFrame) {
    let entries = state.registry.snapshot();
    let mut tasks = Vec::with_capacity(entries.len());

    for (key, session) in entries {
        if session.tx.is_closed() {
            continue;
        }

        let buffered = session.tx.buffered_bytes();
        let admitted = session.lock_throttle().should_send(
            StreamKind::Audio,
            buffered,
            frame.frame_num,
            Instant::now(),
        );
        if !admitted {
            continue;
        }

        if key.l < 0 || key.r < key.l || key.r as usize > frame.bins.len() {
            tracing::warn!(
                unique_id = %session.unique_id,
                l = key.l,
                r = key.r,
                "subscription window outside spectrum; skipping"
            );
            continue;
        }
        let (l, r) = (key.l as usize, key.r as usize);

        let state = state.clone();
        let bins = frame.bins.clone();
        let frame_num = frame.frame_num;
        tasks.push(tokio::task::spawn_blocking(move || {
            service_audio_subscriber(&state, &session, &bins[l..r], frame_num);
        }));
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = ?e, "audio worker task failed");
        }
    }
}

fn service_audio_subscriber(
    state: &Arc<AppState>,
    session: &Arc<AudioSession>,
    spectrum_slice: &[Complex32],
    frame_num: u64,
) {
    let tuning = session.lock_params().tuning();
    let result = session
        .lock_pipeline()
        .process(spectrum_slice, frame_num, &tuning);

    match result {
        Ok(packets) => {
            let mut bits = 0usize;
            for packet in packets {
                let len = packet.len();
                match session.tx.send_packet(Bytes::from(packet)) {
                    SendOutcome::Sent => bits += len * 8,
                    SendOutcome::Dropped => {}
                    // Connection went away mid-frame; the close handler owns
                    // cleanup, this task just stops producing.
                    SendOutcome::Closed => return,
                }
            }
            if bits > 0 {
                state.total_audio_bits.fetch_add(bits, Ordering::Relaxed);
            }
        }
        Err(e) => {
            tracing::warn!(
                unique_id = %session.unique_id,
                frame_num,
                error = ?e,
                "audio frame processing failed; dropping frame"
            );
        }
    }
}

/// Fans one quantized waterfall buffer (all downsample levels concatenated)
/// out to the waterfall clients, with the same adaptive throttling keyed on
/// each connection's outbound pressure.
pub fn dispatch_waterfall(state: &Arc<AppState>, frame_num: u64, quantized: Arc<Vec<i8>>) {
    let mut level_offset = 0usize;
    for level in 0..state.rt.downsample_levels {
        // Snapshot before taking any client locks; holding a map shard
        // while locking params would invert the order the window command
        // takes them in.
        let clients: Vec<_> = state.waterfall_clients[level]
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for client in clients {
            if client.tx.is_closed() {
                continue;
            }

            let buffered = client.tx.buffered_bytes();
            let admitted = client.lock_throttle().should_send(
                StreamKind::Waterfall,
                buffered,
                frame_num,
                Instant::now(),
            );
            if !admitted {
                continue;
            }

            let p = *client.lock_params();
            if p.level != level {
                continue;
            }
            let job = WaterfallJob {
                frame_num,
                level,
                l: p.l,
                r: p.r,
                quantized_offset: level_offset + p.l,
                quantized: quantized.clone(),
            };
            let _ = client.tx.send_job(job);
        }
        level_offset += state.rt.fft_result_size >> level;
    }
}
