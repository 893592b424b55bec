use skywave_core::config::{
    AudioCompression, Config, Defaults, Input, Limits, Server, SignalType, WebSdr,
};

fn base_config() -> Config {
    Config {
        server: Server::default(),
        websdr: WebSdr::default(),
        limits: Limits::default(),
        input: Input {
            sps: 60_000_000,
            frequency: 0,
            signal: SignalType::Real,
            fft_size: 1_048_576,
            audio_sps: 12_000,
            waterfall_size: 1024,
            audio_compression: AudioCompression::Flac,
            defaults: Defaults {
                frequency: -1,
                modulation: "LSB".to_string(),
            },
        },
    }
}

#[test]
fn runtime_defaults_use_configured_modulation() {
    let cfg = base_config();
    let rt = cfg.runtime().unwrap();

    assert_eq!(rt.default_mode_str, "LSB");
    assert!(rt.audio_max_sps > 0);
    assert!(rt.audio_max_fft_size >= 32);
    assert!(rt.default_l >= 0);
    assert!(rt.default_r >= rt.default_l);
    assert!(
        (rt.default_r - rt.default_l) as usize <= rt.audio_max_fft_size.min(rt.fft_result_size)
    );
    // LSB default window sits below the center frequency.
    assert!((rt.default_r as f64) <= rt.default_m + 1.0);
}

#[test]
fn runtime_rejects_invalid_geometry() {
    let mut cfg = base_config();
    cfg.input.fft_size = 100_000; // not a power of two
    assert!(cfg.runtime().is_err());

    let mut cfg = base_config();
    cfg.input.audio_sps = 96_000; // above the 48 kHz cap
    assert!(cfg.runtime().is_err());

    let mut cfg = base_config();
    cfg.input.waterfall_size = 1 << 30;
    assert!(cfg.runtime().is_err());
}

#[test]
fn iq_input_doubles_result_size_and_shifts_basefreq() {
    let mut cfg = base_config();
    cfg.input.signal = SignalType::Iq;
    cfg.input.sps = 2_000_000;
    cfg.input.fft_size = 65_536;
    cfg.input.frequency = 7_100_000;
    let rt = cfg.runtime().unwrap();
    assert!(!rt.is_real);
    assert_eq!(rt.fft_result_size, 65_536);
    assert_eq!(rt.basefreq, 7_100_000 - 1_000_000);
    assert_eq!(rt.total_bandwidth, 2_000_000);
}
