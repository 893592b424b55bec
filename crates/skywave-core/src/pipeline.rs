//! Per-subscription demodulation pipeline: spectral window extraction,
//! inverse FFT with 50% overlap-add, demodulation, conditioning and
//! streaming encode.
//!
//! One instance per audio subscription; the dispatcher locks it for the
//! duration of one frame, so no internal synchronization is needed.

use crate::codec::flac_stream::FlacMode;
use crate::codec::{AudioCodec, PacketMeta, StreamEncoder};
use crate::dsp::agc::Agc;
use crate::dsp::blanker;
use crate::dsp::dc_blocker::DcBlocker;
use crate::dsp::demod::{
    add_complex, add_f32, float_to_i16_centered, negate_complex, negate_f32,
    polar_discriminator_fm, soft_limit, DemodulationMode,
};
use crate::dsp::noise_gate::{GatePreset, NoiseGate};
use crate::dsp::planner;
use crate::dsp::sam_pll::SamPll;
use num_complex::Complex32;
use realfft::ComplexToReal;
use rustfft::Fft;
use std::sync::Arc;

/// Carrier reconstruction keeps only bins within this band around the
/// carrier before the second inverse FFT.
const CARRIER_CUTOFF_HZ: usize = 500;
/// Mono audio is boosted 50% relative to the stereo decode.
const MONO_BOOST: f32 = 1.5;
const STEREO_GAIN: f32 = 0.5;
const STEREO_LIMIT_THRESHOLD: f32 = 2.0;

/// Per-frame snapshot of the client's tuning, taken once under the params
/// lock so the DSP never sees a half-updated state.
#[derive(Debug, Clone, Copy)]
pub struct TuningParams {
    pub l: i32,
    pub r: i32,
    pub m: f64,
    pub mode: DemodulationMode,
    pub am_stereo: bool,
    pub mute: bool,
    pub agc_enabled: bool,
}

pub struct AudioPipeline {
    audio_rate: usize,
    audio_fft_size: usize,
    is_real_input: bool,
    ifft: Arc<dyn Fft<f32>>,
    c2r_ifft: Arc<dyn ComplexToReal<f32>>,
    c2r_scratch: Vec<Complex32>,
    scratch: Vec<Complex32>,
    buf_in: Vec<Complex32>,
    baseband: Vec<Complex32>,
    carrier: Vec<Complex32>,
    baseband_prev: Vec<Complex32>,
    carrier_prev: Vec<Complex32>,
    real: Vec<f32>,
    real_prev: Vec<f32>,
    pcm_i16: Vec<i16>,
    pcm_mono: Vec<i32>,
    pcm_stereo: Vec<i32>,
    dc: DcBlocker,
    gate: NoiseGate,
    agc: Agc,
    /// Created on the first AM frame; USB/LSB/FM subscriptions never pay
    /// for the loop state.
    pll: Option<SamPll>,
    fm_prev: Complex32,
    encoder: StreamEncoder,
}

impl AudioPipeline {
    pub fn new(
        sample_rate: usize,
        audio_fft_size: usize,
        is_real_input: bool,
        codec: AudioCodec,
        flac_mode: FlacMode,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            audio_fft_size >= 4 && audio_fft_size % 2 == 0,
            "audio_fft_size must be even and >= 4 (got {audio_fft_size})"
        );

        let ifft = planner::plan_inverse_c2c(audio_fft_size);
        let c2r_ifft = planner::plan_inverse_c2r(audio_fft_size);
        let c2r_scratch = c2r_ifft.make_scratch_vec();
        let scratch =
            vec![Complex32::new(0.0, 0.0); ifft.get_inplace_scratch_len().max(1)];

        let frame_samples = audio_fft_size / 2;
        let encoder = StreamEncoder::new(codec, sample_rate, 1, frame_samples, flac_mode)?;

        Ok(Self {
            audio_rate: sample_rate,
            audio_fft_size,
            is_real_input,
            ifft,
            c2r_ifft,
            c2r_scratch,
            scratch,
            buf_in: vec![Complex32::new(0.0, 0.0); audio_fft_size],
            baseband: vec![Complex32::new(0.0, 0.0); audio_fft_size],
            carrier: vec![Complex32::new(0.0, 0.0); audio_fft_size],
            baseband_prev: vec![Complex32::new(0.0, 0.0); frame_samples],
            carrier_prev: vec![Complex32::new(0.0, 0.0); frame_samples],
            real: vec![0.0; audio_fft_size],
            real_prev: vec![0.0; frame_samples],
            pcm_i16: vec![0; frame_samples],
            pcm_mono: vec![0; frame_samples],
            pcm_stereo: vec![0; frame_samples * 2],
            dc: DcBlocker::new(((sample_rate / 750) * 2).max(2)),
            gate: NoiseGate::new(GatePreset::Balanced),
            agc: Agc::new(0.1, 100.0, 30.0, 100.0, sample_rate as f32),
            pll: None,
            fm_prev: Complex32::new(0.0, 0.0),
            encoder,
        })
    }

    /// Stream header packet for the handshake (FLAC only).
    pub fn header_packet(&self) -> anyhow::Result<Option<Vec<u8>>> {
        self.encoder.header_packet()
    }

    pub fn reset_agc(&mut self) {
        self.agc.reset();
    }

    /// Selects the AGC profile for a new demodulation mode and resets the
    /// loop state that a mode switch invalidates.
    pub fn apply_mode_change(&mut self, mode: DemodulationMode, am_stereo: bool) {
        tracing::debug!(mode = mode.as_str(), am_stereo, "demodulation mode change");
        self.agc.reset();
        match mode {
            DemodulationMode::Am => self.agc.configure_for_am(),
            _ => self.agc.configure_for_ssb(),
        }
        self.gate.reset();
        if mode == DemodulationMode::Am {
            let pll = self
                .pll
                .get_or_insert_with(|| SamPll::new(self.audio_rate as f64));
            pll.set_stereo_mode(am_stereo);
            pll.reset();
        }
    }

    /// Rebuilds the encoder for a new channel count. Returns the fresh
    /// stream header packet when the codec has one. Runs under the same
    /// lock as `process`, so a racing frame serializes before or after the
    /// swap and never reaches the wrong encoder.
    pub fn set_channels(&mut self, channels: usize) -> anyhow::Result<Option<Vec<u8>>> {
        self.encoder.reconfigure_channels(channels)
    }

    pub fn channels(&self) -> u32 {
        self.encoder.channels()
    }

    pub fn set_noise_gate_enabled(&mut self, enabled: bool) {
        self.gate.set_enabled(enabled);
    }

    pub fn set_noise_gate_preset(&mut self, preset: GatePreset) {
        self.gate.set_preset(preset);
    }

    pub fn set_noise_blanker_enabled(&mut self, enabled: bool) {
        self.agc.set_noise_blanker_enabled(enabled);
    }

    /// Runs one spectrum frame through demodulation, conditioning and the
    /// encoder. Returns zero or more wire-ready packets. Errors are scoped
    /// to this frame; the pipeline remains usable for the next one.
    pub fn process(
        &mut self,
        spectrum_slice: &[Complex32],
        frame_num: u64,
        params: &TuningParams,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        if params.mute {
            return Ok(Vec::new());
        }
        anyhow::ensure!(
            spectrum_slice.len() <= self.audio_fft_size,
            "window of {} bins exceeds audio fft size {}",
            spectrum_slice.len(),
            self.audio_fft_size
        );

        let pwr: f64 = spectrum_slice
            .iter()
            .map(|c| f64::from(c.norm_sqr()))
            .sum();

        self.demodulate(spectrum_slice, frame_num, params)?;

        let half = self.audio_fft_size / 2;
        let stereo = params.mode == DemodulationMode::Am && params.am_stereo;

        self.encoder.set_metadata(PacketMeta {
            frame_num,
            l: 0,
            m: params.m,
            r: spectrum_slice.len() as i32,
            pwr,
        });

        if stereo {
            self.condition_stereo();
            self.encoder.process_samples(&self.pcm_stereo)
        } else {
            // The second half carries into the next frame's overlap-add.
            self.real_prev.copy_from_slice(&self.real[half..]);
            self.condition_mono(params.agc_enabled)?;
            self.encoder.process_samples(&self.pcm_mono)
        }
    }

    fn invert_for_parity(&self, frame_num: u64, audio_m_idx: i32) -> bool {
        // With 50% overlap every other frame lands phase-inverted; whether
        // the even or odd center bins are affected depends on whether the
        // wideband input was real or complex.
        frame_num % 2 == 1
            && ((audio_m_idx % 2 == 0 && !self.is_real_input)
                || (audio_m_idx % 2 != 0 && self.is_real_input))
    }

    fn demodulate(
        &mut self,
        spectrum_slice: &[Complex32],
        frame_num: u64,
        params: &TuningParams,
    ) -> anyhow::Result<()> {
        let len = spectrum_slice.len() as i32;
        let audio_m_idx = params.m.floor() as i32;
        let audio_m_rel = audio_m_idx - params.l;
        let n = self.audio_fft_size as i32;
        let half = (self.audio_fft_size / 2) as i32;

        match params.mode {
            DemodulationMode::Usb | DemodulationMode::Lsb => {
                // C2R IFFT input: N/2+1 bins in hermitian order.
                let c2r_len = self.audio_fft_size / 2 + 1;
                self.buf_in[..c2r_len].fill(Complex32::new(0.0, 0.0));

                if params.mode == DemodulationMode::Usb {
                    let copy_l = 0.max(audio_m_rel);
                    let copy_r = len.min(audio_m_rel + n);
                    for i in copy_l..copy_r {
                        let dst = (i - audio_m_rel) as usize;
                        if dst < c2r_len {
                            self.buf_in[dst] = spectrum_slice[i as usize];
                        }
                    }
                } else {
                    // LSB: mirrored copy, then time reversal below.
                    let copy_l = 0.max(audio_m_rel - n + 1);
                    let copy_r = len.min(audio_m_rel + 1);
                    if copy_r >= copy_l {
                        let dst0 = (audio_m_rel - copy_r + 1) as usize;
                        let count = (copy_r - copy_l) as usize;
                        for k in 0..count {
                            let dst = dst0 + k;
                            if dst < c2r_len {
                                self.buf_in[dst] = spectrum_slice[(copy_r as usize) - 1 - k];
                            }
                        }
                    }
                }

                // The c2r transform needs purely real DC and Nyquist bins.
                self.buf_in[0].im = 0.0;
                self.buf_in[c2r_len - 1].im = 0.0;
                let _ = self.c2r_ifft.process_with_scratch(
                    &mut self.buf_in[..c2r_len],
                    &mut self.real,
                    &mut self.c2r_scratch,
                );

                if params.mode == DemodulationMode::Lsb {
                    self.real.reverse();
                }

                if self.invert_for_parity(frame_num, audio_m_idx) {
                    negate_f32(&mut self.real);
                }
                add_f32(
                    &mut self.real[..self.audio_fft_size / 2],
                    &self.real_prev,
                );
            }
            DemodulationMode::Am | DemodulationMode::Fm => {
                self.buf_in.fill(Complex32::new(0.0, 0.0));
                // Positive frequencies land in [0, half), negative wrap into
                // the top of the IFFT input.
                let pos_copy_l = 0.max(audio_m_rel);
                let pos_copy_r = len.min(audio_m_rel + half);
                for i in pos_copy_l..pos_copy_r {
                    let dst = (i - audio_m_rel) as usize;
                    self.buf_in[dst] = spectrum_slice[i as usize];
                }
                let neg_copy_l = 0.max(audio_m_rel - half + 1);
                let neg_copy_r = len.min(audio_m_rel);
                for i in neg_copy_l..neg_copy_r {
                    let dst = (n - (audio_m_rel - i)) as usize;
                    if dst < self.buf_in.len() {
                        self.buf_in[dst] = spectrum_slice[i as usize];
                    }
                }

                self.baseband.copy_from_slice(&self.buf_in);
                self.ifft
                    .process_with_scratch(&mut self.baseband, &mut self.scratch);

                if params.mode == DemodulationMode::Am {
                    // Carrier reconstruction: everything above +-500 Hz is
                    // zeroed before the second inverse transform.
                    self.carrier.copy_from_slice(&self.buf_in);
                    let cutoff = (CARRIER_CUTOFF_HZ * self.audio_fft_size / self.audio_rate)
                        .min(self.audio_fft_size / 2);
                    for c in &mut self.carrier[cutoff..self.audio_fft_size - cutoff] {
                        *c = Complex32::new(0.0, 0.0);
                    }
                    self.ifft
                        .process_with_scratch(&mut self.carrier, &mut self.scratch);
                }

                if self.invert_for_parity(frame_num, audio_m_idx) {
                    negate_complex(&mut self.baseband);
                    if params.mode == DemodulationMode::Am {
                        negate_complex(&mut self.carrier);
                    }
                }

                let half_u = self.audio_fft_size / 2;
                add_complex(&mut self.baseband[..half_u], &self.baseband_prev);
                blanker::blank_impulses(
                    &mut self.baseband[..half_u],
                    blanker::DEFAULT_THRESHOLD_MUL,
                    blanker::DEFAULT_BLANK_LEN,
                );

                match params.mode {
                    DemodulationMode::Am => {
                        add_complex(&mut self.carrier[..half_u], &self.carrier_prev);
                        blanker::blank_impulses(
                            &mut self.carrier[..half_u],
                            blanker::DEFAULT_THRESHOLD_MUL,
                            blanker::DEFAULT_BLANK_LEN,
                        );

                        let rate = self.audio_rate as f64;
                        let pll = self.pll.get_or_insert_with(|| SamPll::new(rate));
                        if params.am_stereo {
                            // L goes into the real buffer, R borrows the
                            // overlap-carry buffer until interleave.
                            for i in 0..half_u {
                                let (l, r) = pll.step_cquam(self.baseband[i]);
                                self.real[i] = l;
                                self.real_prev[i] = r;
                            }
                        } else {
                            for i in 0..half_u {
                                self.real[i] = pll.step(self.baseband[i]);
                            }
                        }
                    }
                    DemodulationMode::Fm => {
                        self.fm_prev = polar_discriminator_fm(
                            &self.baseband[..half_u],
                            self.fm_prev,
                            &mut self.real[..half_u],
                        );
                    }
                    _ => unreachable!(),
                }
                self.real[half_u..].fill(0.0);

                self.baseband_prev
                    .copy_from_slice(&self.baseband[half_u..]);
                if params.mode == DemodulationMode::Am {
                    self.carrier_prev.copy_from_slice(&self.carrier[half_u..]);
                }
            }
        }
        Ok(())
    }

    fn condition_mono(&mut self, agc_enabled: bool) -> anyhow::Result<()> {
        let half = self.audio_fft_size / 2;
        let audio = &mut self.real[..half];
        for v in audio.iter() {
            anyhow::ensure!(v.is_finite(), "non-finite sample in demodulated audio");
        }

        self.dc.remove_dc(audio);
        self.gate.process(audio);
        if agc_enabled {
            self.agc.process(audio);
        }

        float_to_i16_centered(audio, &mut self.pcm_i16, 32768.0 * MONO_BOOST);
        for (dst, src) in self.pcm_mono.iter_mut().zip(self.pcm_i16.iter()) {
            *dst = i32::from(*src);
        }
        Ok(())
    }

    fn condition_stereo(&mut self) {
        // The PLL already DC-blocks and level-normalizes both channels, so
        // the stereo path only limits, scales and interleaves.
        let half = self.audio_fft_size / 2;
        for i in 0..half {
            let l = soft_limit(self.real[i] * STEREO_GAIN, STEREO_LIMIT_THRESHOLD);
            let r = soft_limit(self.real_prev[i] * STEREO_GAIN, STEREO_LIMIT_THRESHOLD);
            let li = ((l * 32767.0) as i32).clamp(-32768, 32767);
            let ri = ((r * 32767.0) as i32).clamp(-32768, 32767);
            self.pcm_stereo[i * 2] = li;
            self.pcm_stereo[i * 2 + 1] = ri;
        }
    }
}
