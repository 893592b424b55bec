use num_complex::Complex32;

pub const DEFAULT_THRESHOLD_MUL: f32 = 3.0;
pub const DEFAULT_BLANK_LEN: usize = 32;

/// Hold-and-blank impulse suppressor for complex baseband. A sample whose
/// magnitude exceeds `threshold_mul * rms` starts a run of `blank_len`
/// samples replaced by the last clean sample, which preserves phase
/// continuity through the hit.
pub fn blank_impulses(buf: &mut [Complex32], threshold_mul: f32, blank_len: usize) {
    if buf.is_empty() || blank_len == 0 {
        return;
    }

    let mut sum_sq = 0.0f64;
    for s in buf.iter() {
        sum_sq += f64::from(s.re) * f64::from(s.re) + f64::from(s.im) * f64::from(s.im);
    }
    if sum_sq <= 0.0 {
        return;
    }
    let rms = (sum_sq / buf.len() as f64).sqrt() as f32;
    if rms <= 0.0 {
        return;
    }

    let thr = threshold_mul * rms;
    let thr_sq = thr * thr;

    let mut hold = 0usize;
    let mut last = Complex32::new(0.0, 0.0);
    for s in buf.iter_mut() {
        let mag_sq = s.re * s.re + s.im * s.im;
        if hold > 0 {
            *s = last;
            hold -= 1;
        } else if mag_sq > thr_sq {
            *s = last;
            hold = blank_len - 1;
        } else {
            last = *s;
        }
    }
}
