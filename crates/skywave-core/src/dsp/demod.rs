use num_complex::Complex32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodulationMode {
    Usb,
    Lsb,
    Am,
    Fm,
}

impl DemodulationMode {
    /// Parses a client-facing mode string. `AM-S` selects C-QUAM stereo,
    /// which is AM demodulation with the stereo decoder enabled.
    pub fn parse(s: &str) -> Option<(Self, bool)> {
        match s {
            "USB" => Some((Self::Usb, false)),
            "LSB" => Some((Self::Lsb, false)),
            "AM" => Some((Self::Am, false)),
            "AM-S" => Some((Self::Am, true)),
            "FM" => Some((Self::Fm, false)),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usb => "USB",
            Self::Lsb => "LSB",
            Self::Am => "AM",
            Self::Fm => "FM",
        }
    }
}

pub fn negate_f32(arr: &mut [f32]) {
    for v in arr.iter_mut() {
        *v = -*v;
    }
}

pub fn negate_complex(arr: &mut [Complex32]) {
    for v in arr.iter_mut() {
        *v = -*v;
    }
}

pub fn add_f32(a: &mut [f32], b: &[f32]) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += *y;
    }
}

pub fn add_complex(a: &mut [Complex32], b: &[Complex32]) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += *y;
    }
}

/// Polar discriminator. `prev` carries the last complex sample of the
/// previous frame across the frame boundary; the new carry is returned.
pub fn polar_discriminator_fm(iq: &[Complex32], mut prev: Complex32, out: &mut [f32]) -> Complex32 {
    for (dst, v) in out.iter_mut().zip(iq.iter()) {
        let d = *v * prev.conj();
        *dst = d.arg();
        prev = *v;
    }
    prev
}

pub fn float_to_i16_centered(samples: &[f32], out: &mut [i16], mult: f32) {
    for (dst, s) in out.iter_mut().zip(samples.iter()) {
        let v = (s * mult + 32768.5).floor() as i32 - 32768;
        *dst = v.clamp(-32768, 32767) as i16;
    }
}

/// Gradual limiter above `threshold`; keeps peaks finite without the harsh
/// distortion of a hard clip.
pub fn soft_limit(x: f32, threshold: f32) -> f32 {
    if x > threshold {
        let excess = x - threshold;
        threshold + excess / (1.0 + excess * 2.0)
    } else if x < -threshold {
        let excess = -x - threshold;
        -threshold - excess / (1.0 + excess * 2.0)
    } else {
        x
    }
}
