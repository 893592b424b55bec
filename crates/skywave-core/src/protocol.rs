use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct BasicInfoDefaults {
    pub frequency: i64,
    pub modulation: String,
    pub l: i32,
    pub m: f64,
    pub r: i32,
}

/// Settings handshake sent as the first text message on the audio and
/// waterfall sockets.
#[derive(Debug, Clone, Serialize)]
pub struct BasicInfo {
    pub sps: i64,
    pub audio_max_sps: i64,
    pub audio_max_fft: usize,
    pub fft_size: usize,
    pub fft_result_size: usize,
    pub waterfall_size: usize,
    pub basefreq: i64,
    pub total_bandwidth: i64,
    pub defaults: BasicInfoDefaults,
    pub waterfall_compression: String,
    pub audio_compression: String,
    pub grid_locator: String,
}

/// Client control messages; a tagged union over `cmd`. Unknown tags and
/// malformed payloads fail deserialization and are silently dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd")]
pub enum ClientCommand {
    #[serde(rename = "window")]
    Window {
        l: i32,
        r: i32,
        #[serde(default)]
        m: Option<f64>,
        #[serde(default)]
        level: Option<i32>,
    },
    #[serde(rename = "demodulation")]
    Demodulation { demodulation: String },
    #[serde(rename = "userid")]
    Userid { userid: String },
    #[serde(rename = "mute")]
    Mute { mute: bool },
    #[serde(rename = "chat")]
    Chat {
        message: String,
        username: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        reply_to_id: Option<String>,
        #[serde(default)]
        reply_to_username: Option<String>,
    },
    #[serde(rename = "noise_gate_enable")]
    NoiseGateEnable { enabled: bool },
    #[serde(rename = "noise_gate_preset")]
    NoiseGatePreset { preset: String },
    #[serde(rename = "agc_enable")]
    AgcEnable { enabled: bool },
}

/// Events-channel heartbeat. `signal_changes` maps a subscription's unique
/// id to `(l, m, r)`; the `(-1, -1, -1)` sentinel marks a disconnect.
#[derive(Debug, Clone, Serialize)]
pub struct EventsInfo {
    pub waterfall_clients: usize,
    pub signal_clients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_changes: Option<std::collections::HashMap<String, (i32, f64, i32)>>,
    pub waterfall_kbits: f64,
    pub audio_kbits: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioPacket<'a> {
    pub frame_num: u64,
    pub l: i32,
    pub m: f64,
    pub r: i32,
    pub pwr: f64,
    pub channels: u32,
    #[serde(with = "serde_bytes")]
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Serialize)]
pub struct WaterfallPacket<'a> {
    pub frame_num: u64,
    pub l: i32,
    pub r: i32,
    #[serde(with = "serde_bytes")]
    pub data: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_deserialize_by_tag() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"cmd":"window","l":100,"r":200,"m":150.5}"#).unwrap();
        assert!(matches!(
            cmd,
            ClientCommand::Window { l: 100, r: 200, m: Some(m), level: None } if m == 150.5
        ));

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"cmd":"noise_gate_preset","preset":"weak-signal"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::NoiseGatePreset { preset } if preset == "weak-signal"));

        assert!(serde_json::from_str::<ClientCommand>(r#"{"cmd":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"cmd":"window","l":1}"#).is_err());
    }

    #[test]
    fn events_info_omits_empty_signal_changes() {
        let info = EventsInfo {
            waterfall_clients: 1,
            signal_clients: 2,
            signal_changes: None,
            waterfall_kbits: 0.0,
            audio_kbits: 0.0,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("signal_changes"));
    }
}
