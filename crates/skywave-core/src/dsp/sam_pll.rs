//! Synchronous AM product detector with a PI-loop PLL, plus the C-QUAM
//! stereo decoder that shares the same loop.
//!
//! The loop runs at 50 Hz bandwidth with 0.707 damping; wide enough to track
//! broadcast carriers that drift, narrow enough that program audio does not
//! pull the NCO.

use num_complex::Complex32;

const LOOP_BANDWIDTH_HZ: f64 = 50.0;
const LOOP_DAMPING: f64 = 0.707;
/// Integrator clamp for stereo decode; ±45 degrees. Without it a deep fade
/// winds the integrator up and the recovery phase jump is audible.
const MAX_ACC: f64 = std::f64::consts::FRAC_PI_4;
const MAG_ALPHA: f32 = 0.01;
const MAG_FLOOR: f32 = 1e-4;

/// One-pole DC blocker, one instance per output channel so stereo decode
/// does not share state between L and R.
#[derive(Debug, Clone, Copy, Default)]
struct DcState {
    xm1: f32,
    ym1: f32,
}

impl DcState {
    fn block(&mut self, x: f32, a: f32) -> f32 {
        let y = x - self.xm1 + a * self.ym1;
        self.xm1 = x;
        self.ym1 = y;
        y
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct SamPll {
    theta: f64,
    dtheta: f64,
    kp: f64,
    ki: f64,
    acc: f64,
    dc_l: DcState,
    dc_r: DcState,
    dc_mono: DcState,
    dc_a_mono: f32,
    dc_a_stereo: f32,
    dc_a: f32,
    mag_avg: f32,
}

impl SamPll {
    pub fn new(sample_rate: f64) -> Self {
        let fs = if sample_rate > 1.0 { sample_rate } else { 48000.0 };
        let wn = 2.0 * std::f64::consts::PI * LOOP_BANDWIDTH_HZ / fs;
        Self {
            theta: 0.0,
            dtheta: 0.0,
            kp: 2.0 * LOOP_DAMPING * wn,
            ki: wn * wn,
            acc: 0.0,
            dc_l: DcState::default(),
            dc_r: DcState::default(),
            dc_mono: DcState::default(),
            dc_a_mono: 0.999,
            dc_a_stereo: 0.999,
            dc_a: 0.999,
            mag_avg: 1.0,
        }
    }

    /// Selects the DC blocker coefficient for mono or stereo decode. Both
    /// calibrations currently agree but remain independently tunable.
    pub fn set_stereo_mode(&mut self, stereo: bool) {
        self.dc_a = if stereo { self.dc_a_stereo } else { self.dc_a_mono };
    }

    pub fn reset(&mut self) {
        self.theta = 0.0;
        self.acc = 0.0;
        self.dc_l.reset();
        self.dc_r.reset();
        self.dc_mono.reset();
        self.mag_avg = 1.0;
    }

    fn wrap_theta(&mut self) {
        while self.theta > std::f64::consts::PI {
            self.theta -= 2.0 * std::f64::consts::PI;
        }
        while self.theta <= -std::f64::consts::PI {
            self.theta += 2.0 * std::f64::consts::PI;
        }
    }

    fn track_magnitude(&mut self, iq: Complex32) -> f32 {
        let mag = iq.norm();
        if mag > MAG_FLOOR {
            self.mag_avg = self.mag_avg * (1.0 - MAG_ALPHA) + mag * MAG_ALPHA;
        }
        if self.mag_avg > MAG_FLOOR {
            1.0 / self.mag_avg
        } else {
            1.0
        }
    }

    fn rotate(&self, i: f32, q: f32) -> (f32, f32) {
        let c = self.theta.cos() as f32;
        let s = self.theta.sin() as f32;
        (i * c + q * s, -i * s + q * c)
    }

    /// Mono SAM product detector: one demodulated sample per IQ input.
    pub fn step(&mut self, iq: Complex32) -> f32 {
        let norm = self.track_magnitude(iq);
        let (ir, qr) = self.rotate(iq.re * norm, iq.im * norm);

        let e = f64::from(qr.atan2(ir));
        self.acc += self.ki * e;
        let u = self.kp * e + self.acc;
        self.theta += self.dtheta + u;
        self.wrap_theta();

        let a = self.dc_a;
        self.dc_mono.block(ir * self.mag_avg, a)
    }

    /// C-QUAM stereo decode: the in-phase component carries L+R, the
    /// quadrature carries L-R. Returns `(left, right)`.
    pub fn step_cquam(&mut self, iq: Complex32) -> (f32, f32) {
        let norm = self.track_magnitude(iq);
        let (ir, qr) = self.rotate(iq.re * norm, iq.im * norm);

        let e = f64::from(qr.atan2(ir));
        self.acc += self.ki * e;
        self.acc = self.acc.clamp(-MAX_ACC, MAX_ACC);
        let u = self.kp * e + self.acc;
        self.theta += self.dtheta + u;
        self.wrap_theta();

        let sum = ir * self.mag_avg;
        // The inversion on the quadrature arm is load-bearing: without it L
        // and R fight each other and the decoded pair pumps in level.
        let diff = -qr * self.mag_avg;

        let a = self.dc_a;
        let left = self.dc_l.block(0.5 * (sum + diff), a);
        let right = self.dc_r.block(0.5 * (sum - diff), a);
        (left, right)
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn integrator(&self) -> f64 {
        self.acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tone_power(samples: &[f32], freq_hz: f32, fs: f32) -> f32 {
        // Correlation against a complex exponential; window chosen by the
        // caller to hold an integer number of cycles.
        let w = 2.0 * std::f32::consts::PI * freq_hz / fs;
        let (mut re, mut im) = (0.0f32, 0.0f32);
        for (n, s) in samples.iter().enumerate() {
            re += s * (w * n as f32).cos();
            im += s * (w * n as f32).sin();
        }
        let n = samples.len() as f32;
        (re / n).powi(2) + (im / n).powi(2)
    }

    #[test]
    fn locks_to_offset_carrier_and_recovers_modulation() {
        let fs = 12000.0f64;
        let mut pll = SamPll::new(fs);
        pll.set_stereo_mode(false);

        // 50% AM at 400 Hz on a carrier with a static phase offset.
        let phi0 = 1.1f64;
        let total = 12000usize;
        let mut out = Vec::with_capacity(total);
        for n in 0..total {
            let env = 1.0 + 0.5 * (2.0 * std::f64::consts::PI * 400.0 * n as f64 / fs).cos();
            let z = Complex32::from_polar(env as f32, phi0 as f32);
            out.push(pll.step(z));
        }

        // Analyze after the documented ~150 ms lock time; 6000 samples is an
        // integer number of 400 Hz cycles at 12 kHz.
        let tail = &out[6000..];
        let fundamental = tone_power(tail, 400.0, fs as f32);
        let h2 = tone_power(tail, 800.0, fs as f32);
        let h3 = tone_power(tail, 1200.0, fs as f32);
        assert!(fundamental > 1e-3, "no 400 Hz fundamental recovered");
        let thd = ((h2 + h3) / fundamental).sqrt();
        assert!(thd < 0.03, "THD too high after lock: {thd}");
    }

    #[test]
    fn cquam_separates_left_and_right() {
        let fs = 12000.0f64;
        let mut pll = SamPll::new(fs);
        pll.set_stereo_mode(true);

        // L = 300 Hz, R = 800 Hz. Encode: I carries carrier + (L+R),
        // Q carries R-L (so the decoder's inverted diff recovers L-R).
        let total = 14000usize;
        let mut left = Vec::with_capacity(total);
        let mut right = Vec::with_capacity(total);
        for n in 0..total {
            let t = n as f64 / fs;
            let l = 0.2 * (2.0 * std::f64::consts::PI * 300.0 * t).cos();
            let r = 0.2 * (2.0 * std::f64::consts::PI * 800.0 * t).cos();
            let z = Complex32::new((1.0 + l + r) as f32, (r - l) as f32);
            let (ol, or) = pll.step_cquam(z);
            left.push(ol);
            right.push(or);
        }

        // 6000 samples = 150 cycles of 300 Hz and 400 cycles of 800 Hz.
        let l_tail = &left[8000..14000];
        let r_tail = &right[8000..14000];
        let l_want = tone_power(l_tail, 300.0, fs as f32);
        let l_leak = tone_power(l_tail, 800.0, fs as f32);
        let r_want = tone_power(r_tail, 800.0, fs as f32);
        let r_leak = tone_power(r_tail, 300.0, fs as f32);
        assert!(
            l_want > l_leak * 100.0,
            "L separation below 20 dB: want={l_want} leak={l_leak}"
        );
        assert!(
            r_want > r_leak * 100.0,
            "R separation below 20 dB: want={r_want} leak={r_leak}"
        );
    }

    proptest! {
        // Phase stays wrapped to (-pi, pi] for arbitrary bounded input.
        #[test]
        fn theta_stays_wrapped(samples in prop::collection::vec((-10.0f32..10.0, -10.0f32..10.0), 1..400)) {
            let mut pll = SamPll::new(12000.0);
            for (re, im) in samples {
                pll.step(Complex32::new(re, im));
                let theta = pll.theta();
                prop_assert!(theta > -std::f64::consts::PI && theta <= std::f64::consts::PI,
                    "theta out of range: {}", theta);
            }
        }

        // Stereo integrator anti-windup: |acc| <= pi/4 after every step.
        #[test]
        fn stereo_integrator_is_clamped(samples in prop::collection::vec((-10.0f32..10.0, -10.0f32..10.0), 1..400)) {
            let mut pll = SamPll::new(12000.0);
            pll.set_stereo_mode(true);
            for (re, im) in samples {
                pll.step_cquam(Complex32::new(re, im));
                prop_assert!(pll.integrator().abs() <= std::f64::consts::FRAC_PI_4 + 1e-12);
            }
        }
    }

    #[test]
    fn reset_clears_loop_state() {
        let mut pll = SamPll::new(12000.0);
        for n in 0..500 {
            pll.step(Complex32::from_polar(1.0, 0.3 + 0.01 * n as f32));
        }
        pll.reset();
        assert_eq!(pll.theta(), 0.0);
        assert_eq!(pll.integrator(), 0.0);
        // First post-reset sample passes through the cleared DC blocker.
        let y = pll.step(Complex32::new(0.5, 0.0));
        assert!(y.is_finite());
    }
}
