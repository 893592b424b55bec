//! Downward expander driven by an envelope-over-noise-floor ratio.
//!
//! The floor tracker only adapts while the envelope sits near it, so loud
//! passages cannot drag the floor up and open the gate permanently.

const NOISE_FLOOR_MIN: f32 = 1e-6;
/// The floor tracker starts high and decays down onto the actual noise
/// level; it can only rise again while the envelope sits near it.
const NOISE_FLOOR_INIT: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePreset {
    Balanced,
    Aggressive,
    WeakSignal,
    Smooth,
    Maximum,
    Cw,
    AmFm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateParams {
    pub alpha_env: f32,
    pub alpha_noise: f32,
    /// Gate opens when envelope/floor rises above this.
    pub open_factor: f32,
    /// Gate closes when envelope/floor falls below this; always below
    /// `open_factor` so a monotonic envelope crosses at most one threshold.
    pub close_factor: f32,
    pub floor_gain: f32,
}

impl GatePreset {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "balanced" => Some(Self::Balanced),
            "aggressive" => Some(Self::Aggressive),
            "weak-signal" => Some(Self::WeakSignal),
            "smooth" => Some(Self::Smooth),
            "maximum" => Some(Self::Maximum),
            "cw" => Some(Self::Cw),
            "am-fm" => Some(Self::AmFm),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
            Self::WeakSignal => "weak-signal",
            Self::Smooth => "smooth",
            Self::Maximum => "maximum",
            Self::Cw => "cw",
            Self::AmFm => "am-fm",
        }
    }

    pub const ALL: [Self; 7] = [
        Self::Balanced,
        Self::Aggressive,
        Self::WeakSignal,
        Self::Smooth,
        Self::Maximum,
        Self::Cw,
        Self::AmFm,
    ];

    pub fn params(self) -> GateParams {
        match self {
            Self::Balanced => GateParams {
                alpha_env: 0.02,
                alpha_noise: 0.002,
                open_factor: 2.5,
                close_factor: 1.8,
                floor_gain: 0.1,
            },
            Self::Aggressive => GateParams {
                alpha_env: 0.03,
                alpha_noise: 0.002,
                open_factor: 3.5,
                close_factor: 2.5,
                floor_gain: 0.03,
            },
            Self::WeakSignal => GateParams {
                alpha_env: 0.01,
                alpha_noise: 0.001,
                open_factor: 1.8,
                close_factor: 1.3,
                floor_gain: 0.25,
            },
            Self::Smooth => GateParams {
                alpha_env: 0.005,
                alpha_noise: 0.001,
                open_factor: 2.2,
                close_factor: 1.6,
                floor_gain: 0.15,
            },
            Self::Maximum => GateParams {
                alpha_env: 0.04,
                alpha_noise: 0.003,
                open_factor: 4.5,
                close_factor: 3.2,
                floor_gain: 0.01,
            },
            Self::Cw => GateParams {
                alpha_env: 0.05,
                alpha_noise: 0.002,
                open_factor: 3.0,
                close_factor: 2.0,
                floor_gain: 0.05,
            },
            Self::AmFm => GateParams {
                alpha_env: 0.015,
                alpha_noise: 0.0015,
                open_factor: 2.0,
                close_factor: 1.5,
                floor_gain: 0.2,
            },
        }
    }
}

pub struct NoiseGate {
    params: GateParams,
    preset: GatePreset,
    enabled: bool,
    envelope: f32,
    noise_floor: f32,
    gate_open: bool,
}

impl NoiseGate {
    pub fn new(preset: GatePreset) -> Self {
        Self {
            params: preset.params(),
            preset,
            enabled: false,
            envelope: 0.0,
            noise_floor: NOISE_FLOOR_INIT,
            gate_open: false,
        }
    }

    pub fn set_preset(&mut self, preset: GatePreset) {
        self.preset = preset;
        self.params = preset.params();
        self.reset();
    }

    pub fn preset(&self) -> GatePreset {
        self.preset
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.reset();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_open(&self) -> bool {
        self.gate_open
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
        self.noise_floor = NOISE_FLOOR_INIT;
        self.gate_open = false;
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        let p = self.params;
        for s in samples.iter_mut() {
            self.envelope += p.alpha_env * (s.abs() - self.envelope);
            // Floor tracker freezes during loud passages.
            if self.envelope < 1.5 * self.noise_floor {
                self.noise_floor += p.alpha_noise * (self.envelope - self.noise_floor);
                self.noise_floor = self.noise_floor.max(NOISE_FLOOR_MIN);
            }
            let ratio = self.envelope / self.noise_floor;
            if !self.gate_open && ratio > p.open_factor {
                self.gate_open = true;
            } else if self.gate_open && ratio < p.close_factor {
                self.gate_open = false;
            }
            if !self.gate_open {
                *s *= p.floor_gain;
            }
        }
    }
}
