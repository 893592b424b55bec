use crate::codec::AudioCodec;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub websdr: WebSdr,
    #[serde(default)]
    pub limits: Limits,
    pub input: Input,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_html_root")]
    pub html_root: String,
    /// Expose other users' tuning in the events channel when > 0.
    #[serde(default = "default_otherusers")]
    pub otherusers: i64,
    /// Worker threads; 0 means hardware concurrency.
    #[serde(default)]
    pub threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSdr {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_grid")]
    pub grid_locator: String,
    #[serde(default = "default_chat_enabled")]
    pub chat_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    #[serde(default = "default_limit")]
    pub audio: usize,
    #[serde(default = "default_limit")]
    pub waterfall: usize,
    #[serde(default = "default_limit")]
    pub events: usize,
    #[serde(default = "default_ws_per_ip")]
    pub ws_per_ip: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Input {
    pub sps: i64,
    pub frequency: i64,
    pub signal: SignalType,
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_audio_sps")]
    pub audio_sps: i64,
    #[serde(default = "default_waterfall_size")]
    pub waterfall_size: usize,
    #[serde(default = "default_audio_compression")]
    pub audio_compression: AudioCompression,
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_default_frequency")]
    pub frequency: i64,
    #[serde(default = "default_default_modulation")]
    pub modulation: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            frequency: default_default_frequency(),
            modulation: default_default_modulation(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Real,
    Iq,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioCompression {
    Flac,
    Opus,
}

impl AudioCompression {
    pub fn codec(self) -> AudioCodec {
        match self {
            Self::Flac => AudioCodec::Flac,
            Self::Opus => AudioCodec::Opus,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flac => "flac",
            Self::Opus => "opus",
        }
    }
}

fn default_port() -> u16 {
    9002
}
fn default_host() -> String {
    "[::]".to_string()
}
fn default_html_root() -> String {
    "frontend/dist/".to_string()
}
fn default_otherusers() -> i64 {
    1
}
fn default_name() -> String {
    "Skywave".to_string()
}
fn default_grid() -> String {
    "-".to_string()
}
fn default_chat_enabled() -> bool {
    true
}
fn default_limit() -> usize {
    1000
}
fn default_ws_per_ip() -> usize {
    50
}
fn default_fft_size() -> usize {
    131_072
}
fn default_audio_sps() -> i64 {
    12_000
}
fn default_waterfall_size() -> usize {
    1024
}
fn default_audio_compression() -> AudioCompression {
    AudioCompression::Flac
}
fn default_default_frequency() -> i64 {
    -1
}
fn default_default_modulation() -> String {
    "USB".to_string()
}

impl Default for Server {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            html_root: default_html_root(),
            otherusers: default_otherusers(),
            threads: 0,
        }
    }
}

impl Default for WebSdr {
    fn default() -> Self {
        Self {
            name: default_name(),
            grid_locator: default_grid(),
            chat_enabled: default_chat_enabled(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            audio: default_limit(),
            waterfall: default_limit(),
            events: default_limit(),
            ws_per_ip: default_ws_per_ip(),
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Values derived from the raw configuration that the rest of the system
/// consumes: FFT geometry, audio bandwidth and default tuning window.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub sps: i64,
    pub fft_size: usize,
    pub fft_result_size: usize,
    pub is_real: bool,
    pub basefreq: i64,
    pub total_bandwidth: i64,
    pub downsample_levels: usize,
    pub audio_max_sps: i64,
    pub audio_max_fft_size: usize,
    pub min_waterfall_fft: usize,
    pub show_other_users: bool,
    pub default_frequency: i64,
    pub default_m: f64,
    pub default_l: i32,
    pub default_r: i32,
    pub default_mode_str: String,
    pub audio_compression: AudioCompression,
}

impl Config {
    pub fn runtime(&self) -> anyhow::Result<Runtime> {
        let input = &self.input;
        let sps = input.sps;
        anyhow::ensure!(sps > 0, "input.sps must be > 0");

        let fft_size = input.fft_size;
        anyhow::ensure!(
            fft_size.is_power_of_two(),
            "input.fft_size must be a power of two"
        );

        let is_real = input.signal == SignalType::Real;
        let (fft_result_size, basefreq, total_bandwidth) = if is_real {
            (fft_size / 2, input.frequency, sps / 2)
        } else {
            (fft_size, input.frequency - sps / 2, sps)
        };

        let min_waterfall_fft = input.waterfall_size;
        let mut downsample_levels = 0usize;
        let mut cur = fft_result_size;
        while cur >= min_waterfall_fft {
            downsample_levels += 1;
            cur /= 2;
        }
        anyhow::ensure!(
            downsample_levels >= 1,
            "waterfall_size too large for fft_result_size"
        );

        let audio_max_sps = input.audio_sps;
        anyhow::ensure!(audio_max_sps > 0, "input.audio_sps must be > 0");
        let max_audio_sps = if is_real { sps / 2 } else { sps };
        anyhow::ensure!(
            audio_max_sps <= max_audio_sps,
            "input.audio_sps must be <= input bandwidth ({max_audio_sps} Hz)"
        );
        anyhow::ensure!(
            audio_max_sps <= 48_000,
            "input.audio_sps must be <= 48000 Hz"
        );

        let audio_max_fft_size =
            ((((audio_max_sps as f64) * (fft_size as f64) / (sps as f64) / 4.0).ceil() as usize)
                * 4)
            .max(32);

        let mut default_frequency = input.defaults.frequency;
        if default_frequency == -1 {
            default_frequency = basefreq + total_bandwidth / 2;
        }

        let mut default_m = if is_real {
            (default_frequency - basefreq) as f64 * (fft_result_size as f64) * 2.0 / (sps as f64)
        } else {
            (default_frequency - basefreq) as f64 * (fft_result_size as f64) / (sps as f64)
        };

        let offsets_300 = 300_i64 * (fft_result_size as i64) / sps;
        let offsets_3k = 3000_i64 * (fft_result_size as i64) / sps;
        let offsets_5k = 5000_i64 * (fft_result_size as i64) / sps;

        let default_mode_str = input.defaults.modulation.to_uppercase();
        let (default_l, default_r) = match default_mode_str.as_str() {
            "LSB" => (
                (default_m as i64 - offsets_3k) as i32,
                (default_m as i64 - offsets_300) as i32,
            ),
            "AM" | "AM-S" | "FM" => (
                (default_m as i64 - offsets_5k) as i32,
                (default_m as i64 + offsets_5k) as i32,
            ),
            "USB" => (
                (default_m as i64 + offsets_300) as i32,
                (default_m as i64 + offsets_3k) as i32,
            ),
            _ => (default_m as i32, (default_m as i64 + offsets_3k) as i32),
        };

        default_m = default_m.clamp(0.0, fft_result_size as f64);
        let mut default_l = default_l.clamp(0, fft_result_size as i32);
        let mut default_r = default_r.clamp(0, fft_result_size as i32);

        let max_window = audio_max_fft_size.min(fft_result_size) as i32;
        if max_window > 0 && (default_r - default_l) > max_window {
            let center = default_m.round() as i32;
            let half = max_window / 2;
            default_l =
                (center - half).clamp(0, (fft_result_size as i32).saturating_sub(max_window));
            default_r = default_l + max_window;
        }

        Ok(Runtime {
            sps,
            fft_size,
            fft_result_size,
            is_real,
            basefreq,
            total_bandwidth,
            downsample_levels,
            audio_max_sps,
            audio_max_fft_size,
            min_waterfall_fft,
            show_other_users: self.server.otherusers > 0,
            default_frequency,
            default_m,
            default_l,
            default_r,
            default_mode_str,
            audio_compression: input.audio_compression,
        })
    }
}
