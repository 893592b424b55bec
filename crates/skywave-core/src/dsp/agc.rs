//! Five-stage hang AGC with look-ahead peak tracking and an optional
//! spectral noise blanker in front of the gain computation.

use num_complex::Complex32;
use rustfft::Fft;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const STAGES: usize = 5;
/// Effective linear gain ceiling is `MAX_GAIN * OUTPUT_SCALE`, about 5x.
/// The relationship between the per-stage gains, the ceiling and the output
/// scale is calibrated empirically; change one and the loudness curve moves.
const MAX_GAIN: f32 = 500.0;
const OUTPUT_SCALE: f32 = 0.01;

const NB_FFT_SIZE: usize = 2048;
const NB_OVERLAP: usize = 1536;
const NB_AVERAGE_WINDOWS: usize = 32;
const NB_THRESHOLD: f32 = 0.140;

pub struct Agc {
    desired_level: f32,
    sample_rate: f32,
    attack_coeff: f32,
    release_coeff: f32,
    fast_attack_coeff: f32,
    am_attack_coeff: f32,
    am_release_coeff: f32,
    look_ahead_samples: usize,
    gains: [f32; STAGES],
    lookahead: std::collections::VecDeque<f32>,
    lookahead_max: std::collections::VecDeque<f32>,
    hang_time: usize,
    hang_counter: usize,
    hang_threshold: f32,
    blanker: SpectralNoiseBlanker,
    scratch: Vec<f32>,
}

impl Agc {
    pub fn new(
        desired_level: f32,
        attack_ms: f32,
        release_ms: f32,
        lookahead_ms: f32,
        sample_rate: f32,
    ) -> Self {
        let look_ahead_samples = (lookahead_ms * sample_rate / 1000.0) as usize;
        let attack_coeff = 1.0 - (-1.0 / (attack_ms * 0.001 * sample_rate)).exp();
        let release_coeff = 1.0 - (-1.0 / (release_ms * 0.003 * sample_rate)).exp();
        let fast_attack_coeff = 1.0 - (-1.0 / (0.003 * sample_rate)).exp();

        let mut agc = Self {
            desired_level,
            sample_rate,
            attack_coeff,
            release_coeff,
            fast_attack_coeff,
            am_attack_coeff: 0.0,
            am_release_coeff: 0.0,
            look_ahead_samples,
            gains: [1.0; STAGES],
            lookahead: std::collections::VecDeque::new(),
            lookahead_max: std::collections::VecDeque::new(),
            hang_time: 0,
            hang_counter: 0,
            hang_threshold: 0.0,
            blanker: SpectralNoiseBlanker::new(),
            scratch: Vec::new(),
        };
        agc.configure_for_ssb();
        agc
    }

    /// SSB / CW profile: mild hold, agile enough for speech syllables.
    pub fn configure_for_ssb(&mut self) {
        self.hang_time = (0.50 * self.sample_rate) as usize;
        self.hang_threshold = 0.15;
        self.am_attack_coeff = self.attack_coeff * 0.5;
        self.am_release_coeff = self.release_coeff * 0.15;
    }

    /// AM broadcast profile: long hold, fast peak control, very slow gain-up.
    pub fn configure_for_am(&mut self) {
        self.hang_time = (2.0 * self.sample_rate) as usize;
        self.hang_threshold = 0.25;
        self.am_attack_coeff = self.attack_coeff * 0.3;
        self.am_release_coeff = self.release_coeff * 0.08;
    }

    pub fn set_noise_blanker_enabled(&mut self, enabled: bool) {
        self.blanker.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn noise_blanker_enabled(&self) -> bool {
        self.blanker.enabled.load(Ordering::Relaxed)
    }

    pub fn reset(&mut self) {
        self.gains = [1.0; STAGES];
        self.lookahead.clear();
        self.lookahead_max.clear();
        self.hang_counter = 0;
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        self.scratch.clear();
        self.scratch.extend_from_slice(samples);
        if self.blanker.enabled.load(Ordering::Relaxed) {
            self.blanker.apply(&mut self.scratch);
        }

        if self.look_ahead_samples == 0 {
            for i in 0..samples.len() {
                let sample = self.scratch[i];
                let peak = sample.abs();
                let desired_gain = (self.desired_level / (peak + 1e-15)).min(MAX_GAIN);
                self.apply_progressive_gain(desired_gain);
                samples[i] = sample * (self.total_gain() * OUTPUT_SCALE);
            }
            return;
        }

        for i in 0..samples.len() {
            let incoming = self.scratch[i];
            self.push(incoming);
            if self.lookahead.len() == self.look_ahead_samples {
                let current_sample = *self.lookahead.front().unwrap_or(&0.0);
                let peak = self.max();
                let desired_gain = (self.desired_level / (peak + 1e-15)).min(MAX_GAIN);
                self.apply_progressive_gain(desired_gain);
                samples[i] = current_sample * (self.total_gain() * OUTPUT_SCALE);
            } else {
                // Output stays muted until the look-ahead window fills.
                samples[i] = 0.0;
            }
        }
    }

    fn total_gain(&self) -> f32 {
        let mut total = 1.0f32;
        for g in &self.gains {
            total *= *g;
        }
        total.min(MAX_GAIN)
    }

    fn push(&mut self, sample: f32) {
        self.lookahead.push_back(sample);
        while let Some(back) = self.lookahead_max.back().copied() {
            if back.abs() < sample.abs() {
                self.lookahead_max.pop_back();
            } else {
                break;
            }
        }
        self.lookahead_max.push_back(sample);
        if self.lookahead.len() > self.look_ahead_samples {
            self.pop();
        }
    }

    fn pop(&mut self) {
        if let Some(sample) = self.lookahead.pop_front() {
            if self.lookahead_max.front().copied() == Some(sample) {
                self.lookahead_max.pop_front();
            }
        }
    }

    fn max(&self) -> f32 {
        self.lookahead_max.front().copied().unwrap_or(0.0).abs()
    }

    fn apply_progressive_gain(&mut self, desired_gain: f32) {
        let stage_desired = desired_gain.powf(1.0 / STAGES as f32).min(MAX_GAIN);
        for g in self.gains.iter_mut() {
            // Hang system: a sharp demand for less gain freezes the stages
            // so syllable gaps do not pump.
            if stage_desired < *g * self.hang_threshold {
                self.hang_counter = self.hang_time;
            }

            if self.hang_counter > 0 {
                self.hang_counter -= 1;
                continue;
            }

            let fast_gain =
                *g * (1.0 - self.fast_attack_coeff) + stage_desired * self.fast_attack_coeff;
            let slow_gain = if stage_desired < *g {
                *g * (1.0 - self.am_attack_coeff) + stage_desired * self.am_attack_coeff
            } else {
                *g * (1.0 - self.am_release_coeff) + stage_desired * self.am_release_coeff
            };
            *g = fast_gain.min(slow_gain).min(MAX_GAIN);
        }

        // Delayed release path for the first (RF) stage.
        if desired_gain > self.gains[0] {
            self.gains[0] = (self.gains[0] * (1.0 - self.release_coeff * 0.1)
                + desired_gain * self.release_coeff * 0.1)
                .min(MAX_GAIN);
        }
    }
}

/// Windowed-overlap spectral whitener plus time-domain impulse blanking.
/// Keeps a rolling average of magnitude spectra; bins that spike above the
/// average get scaled back by `1/sqrt(ratio)`, then residual time-domain
/// impulses above the dynamic threshold are attenuated proportionally.
struct SpectralNoiseBlanker {
    enabled: AtomicBool,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    fft_buf: Vec<Complex32>,
    fft_scratch: Vec<Complex32>,
    magnitude: Vec<f32>,
    spectrum_history: Vec<Vec<f32>>,
    spectrum_average: Vec<f32>,
    history_index: usize,
}

impl SpectralNoiseBlanker {
    fn new() -> Self {
        let fft = crate::dsp::planner::plan_forward_c2c(NB_FFT_SIZE);
        let ifft = crate::dsp::planner::plan_inverse_c2c(NB_FFT_SIZE);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        Self {
            enabled: AtomicBool::new(false),
            fft,
            ifft,
            fft_buf: vec![Complex32::new(0.0, 0.0); NB_FFT_SIZE],
            fft_scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            magnitude: vec![0.0; NB_FFT_SIZE / 2],
            spectrum_history: vec![vec![0.0; NB_FFT_SIZE / 2]; NB_AVERAGE_WINDOWS],
            spectrum_average: vec![0.0; NB_FFT_SIZE / 2],
            history_index: 0,
        }
    }

    fn apply(&mut self, buffer: &mut [f32]) {
        let len = buffer.len();
        let mut i = 0usize;
        while i < len {
            let copy = NB_FFT_SIZE.min(len - i);
            for j in 0..NB_FFT_SIZE {
                let v = if j < copy { buffer[i + j] } else { 0.0 };
                self.fft_buf[j] = Complex32::new(v, 0.0);
            }
            self.fft
                .process_with_scratch(&mut self.fft_buf, &mut self.fft_scratch);

            for j in 0..NB_FFT_SIZE / 2 {
                self.magnitude[j] = self.fft_buf[j].norm();
            }
            self.spectrum_history[self.history_index].copy_from_slice(&self.magnitude);
            self.history_index = (self.history_index + 1) % NB_AVERAGE_WINDOWS;
            for j in 0..NB_FFT_SIZE / 2 {
                let sum: f32 = self.spectrum_history.iter().map(|h| h[j]).sum();
                self.spectrum_average[j] = sum / NB_AVERAGE_WINDOWS as f32;
            }
            let avg_signal_level = self.spectrum_average.iter().sum::<f32>()
                / self.spectrum_average.len() as f32;
            let dynamic_threshold = NB_THRESHOLD * avg_signal_level;

            for j in 0..NB_FFT_SIZE / 2 {
                let ratio = self.magnitude[j] / (self.spectrum_average[j] + 1e-12);
                if ratio > 1.0 {
                    self.fft_buf[j] *= 1.0 / ratio.sqrt();
                }
            }

            self.ifft
                .process_with_scratch(&mut self.fft_buf, &mut self.fft_scratch);

            for j in 0..NB_FFT_SIZE {
                if i + j >= len {
                    break;
                }
                // The inverse transform is only a detector; reductions are
                // applied to the original samples.
                let magnitude = self.fft_buf[j].norm() / NB_FFT_SIZE as f32;
                if magnitude > dynamic_threshold {
                    buffer[i + j] *= dynamic_threshold / (magnitude + 1e-12);
                }
            }

            i += NB_OVERLAP;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_respects_gain_ceiling() {
        // For any bounded input the output magnitude never exceeds
        // desired_level * MAX_GAIN * OUTPUT_SCALE once the window is full.
        let mut agc = Agc::new(0.1, 100.0, 30.0, 100.0, 12000.0);
        let bound = 0.1 * MAX_GAIN * OUTPUT_SCALE + 1e-3;
        for amplitude in [0.0001f32, 0.01, 0.1, 1.0] {
            agc.reset();
            let mut buf: Vec<f32> = (0..24000)
                .map(|n| amplitude * (2.0 * std::f32::consts::PI * n as f32 / 24.0).sin())
                .collect();
            agc.process(&mut buf);
            for v in &buf {
                assert!(v.abs() <= bound, "amplitude {amplitude}: output {v} above {bound}");
            }
        }
    }

    #[test]
    fn steady_tone_settles_to_calibrated_level() {
        let fs = 12000.0f32;
        let mut agc = Agc::new(0.1, 100.0, 30.0, 100.0, fs);
        let mut buf: Vec<f32> = (0..36000)
            .map(|n| 0.4 * (2.0 * std::f32::consts::PI * 500.0 * n as f32 / fs).sin())
            .collect();
        agc.process(&mut buf);
        // Settled peak sits at desired_level * OUTPUT_SCALE within 0.5 dB.
        let expected = 0.1 * OUTPUT_SCALE;
        let peak = buf[30000..].iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let db = 20.0 * (peak / expected).log10();
        assert!(db.abs() < 0.5, "settled {db:.2} dB away from target (peak {peak})");
    }

    #[test]
    fn lookahead_prefix_is_muted() {
        let fs = 12000.0f32;
        let mut agc = Agc::new(0.1, 100.0, 30.0, 100.0, fs);
        let look_ahead = (100.0 * fs / 1000.0) as usize;
        let mut buf = vec![0.5f32; look_ahead + 10];
        agc.process(&mut buf);
        for v in &buf[..look_ahead - 1] {
            assert_eq!(*v, 0.0);
        }
        assert!(buf[look_ahead].abs() > 0.0);
    }

    #[test]
    fn am_profile_releases_slower_than_ssb() {
        let mut agc = Agc::new(0.1, 100.0, 30.0, 100.0, 12000.0);
        agc.configure_for_ssb();
        let ssb_release = agc.am_release_coeff;
        agc.configure_for_am();
        let am_release = agc.am_release_coeff;
        assert!(am_release < ssb_release);
        assert!(agc.hang_time > (1.9 * 12000.0) as usize);
    }

    #[test]
    fn noise_blanker_flag_toggles() {
        let mut agc = Agc::new(0.1, 100.0, 30.0, 0.0, 12000.0);
        assert!(!agc.noise_blanker_enabled());
        agc.set_noise_blanker_enabled(true);
        assert!(agc.noise_blanker_enabled());
        // Processing with the blanker enabled stays finite.
        let mut buf: Vec<f32> = (0..4096).map(|n| ((n % 64) as f32 - 32.0) / 64.0).collect();
        buf[1000] = 50.0;
        agc.process(&mut buf);
        assert!(buf.iter().all(|v| v.is_finite()));
    }
}
