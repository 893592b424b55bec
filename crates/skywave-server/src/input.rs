//! Spectrum input: the external FFT producer pipes frequency-domain frames
//! into stdin as interleaved little-endian f32 I/Q pairs, one frame per
//! `fft_result_size` bins.

use crate::dispatcher::{self, SpectrumFrame};
use crate::state::AppState;
use num_complex::Complex32;
use skywave_core::config::Runtime;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn spawn_stdin_input(state: Arc<AppState>, frames_tx: mpsc::Sender<SpectrumFrame>) {
    std::thread::spawn(move || read_loop(state, frames_tx));
}

fn read_loop(state: Arc<AppState>, frames_tx: mpsc::Sender<SpectrumFrame>) {
    let rt = state.rt.clone();
    let bins = rt.fft_result_size;
    let mut raw = vec![0u8; bins * 8];
    let mut stdin = std::io::stdin().lock();
    let mut frame_num = 0u64;
    // Complex input frames arrive with DC in the middle; rotate once at
    // publish so every consumer indexes bins directly.
    let rotate = if rt.is_real {
        0
    } else {
        (rt.fft_size / 2 + 1) % bins
    };

    loop {
        if crate::shutdown::is_shutdown_requested() {
            break;
        }
        if stdin.read_exact(&mut raw).is_err() {
            tracing::info!("spectrum input reached EOF");
            break;
        }

        let mut frame: Vec<Complex32> = raw
            .chunks_exact(8)
            .map(|c| {
                Complex32::new(
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect();
        if rotate != 0 {
            frame.rotate_left(rotate);
        }

        let quantized = Arc::new(quantize_waterfall(&rt, &frame));
        dispatcher::dispatch_waterfall(&state, frame_num, quantized);

        let frame = SpectrumFrame {
            frame_num,
            bins: Arc::from(frame),
        };
        if frames_tx.blocking_send(frame).is_err() {
            break;
        }
        frame_num += 1;
    }
}

/// Stand-in for the external waterfall quantizer: dB power per bin as i8,
/// max-pooled per downsample level, levels concatenated in order.
fn quantize_waterfall(rt: &Runtime, bins: &[Complex32]) -> Vec<i8> {
    let mut total = 0usize;
    for level in 0..rt.downsample_levels {
        total += rt.fft_result_size >> level;
    }
    let mut out = Vec::with_capacity(total);

    let mut cur: Vec<i8> = bins
        .iter()
        .map(|c| {
            let db = 10.0 * (c.norm_sqr() + 1e-20).log10();
            db.clamp(-128.0, 127.0) as i8
        })
        .collect();
    out.extend_from_slice(&cur);
    for _ in 1..rt.downsample_levels {
        cur = cur
            .chunks(2)
            .map(|pair| pair.iter().copied().max().unwrap_or(-128))
            .collect();
        out.extend_from_slice(&cur);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywave_core::config::Config;

    #[test]
    fn quantized_levels_concatenate_to_expected_length() {
        let cfg: Config = serde_json::from_str(
            r#"{"input":{"sps":2400000,"frequency":0,"signal":"real","fft_size":131072,"waterfall_size":1024}}"#,
        )
        .unwrap();
        let rt = cfg.runtime().unwrap();
        let bins = vec![Complex32::new(1.0, 0.0); rt.fft_result_size];
        let q = quantize_waterfall(&rt, &bins);
        let expected: usize = (0..rt.downsample_levels)
            .map(|l| rt.fft_result_size >> l)
            .sum();
        assert_eq!(q.len(), expected);
    }

    #[test]
    fn downsampling_keeps_peaks() {
        let cfg: Config = serde_json::from_str(
            r#"{"input":{"sps":2400000,"frequency":0,"signal":"real","fft_size":131072,"waterfall_size":1024}}"#,
        )
        .unwrap();
        let rt = cfg.runtime().unwrap();
        let mut bins = vec![Complex32::new(1e-6, 0.0); rt.fft_result_size];
        bins[100] = Complex32::new(100.0, 0.0);
        let q = quantize_waterfall(&rt, &bins);
        // The spike survives into the second level at half the index.
        let level1 = &q[rt.fft_result_size..rt.fft_result_size + rt.fft_result_size / 2];
        assert_eq!(level1[50], q[100]);
    }
}
