use crate::registry::SignalRegistry;
use crate::throttle::ThrottleState;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use skywave_core::codec::flac_stream::FlacMode;
use skywave_core::config::{Config, Runtime};
use skywave_core::dsp::demod::DemodulationMode;
use skywave_core::dsp::noise_gate::GatePreset;
use skywave_core::pipeline::{AudioPipeline, TuningParams};
use skywave_core::protocol::{BasicInfo, BasicInfoDefaults, EventsInfo};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

pub type ClientId = u64;

/// Hard cap on enqueued-but-unsent bytes per connection; past this the
/// packet is dropped unconditionally.
pub const MAX_OUTBOUND_BUFFERED: usize = 800_000;

const BINARY_CHANNEL_CAPACITY: usize = 256;
const WATERFALL_CHANNEL_CAPACITY: usize = 64;
const TEXT_CHANNEL_CAPACITY: usize = 64;
pub const CHAT_HISTORY_LEN: usize = 50;

pub type TextTx = mpsc::Sender<Arc<str>>;
pub type TextRx = mpsc::Receiver<Arc<str>>;

pub fn text_channel() -> (TextTx, TextRx) {
    mpsc::channel(TEXT_CHANNEL_CAPACITY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
    Closed,
}

/// Outbound binary channel with a shared byte gauge; the gauge stands in
/// for the transport's buffered-amount and drives adaptive throttling.
#[derive(Clone)]
pub struct BinaryTx {
    tx: mpsc::Sender<Bytes>,
    buffered: Arc<AtomicUsize>,
}

impl BinaryTx {
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn send_packet(&self, bytes: Bytes) -> SendOutcome {
        if self.tx.is_closed() {
            return SendOutcome::Closed;
        }
        let len = bytes.len();
        if self.buffered.load(Ordering::Relaxed) + len > MAX_OUTBOUND_BUFFERED {
            return SendOutcome::Dropped;
        }
        self.buffered.fetch_add(len, Ordering::Relaxed);
        match self.tx.try_send(bytes) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(b)) => {
                self.buffered.fetch_sub(b.len(), Ordering::Relaxed);
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(b)) => {
                self.buffered.fetch_sub(b.len(), Ordering::Relaxed);
                SendOutcome::Closed
            }
        }
    }
}

pub struct BinaryRx {
    rx: mpsc::Receiver<Bytes>,
    buffered: Arc<AtomicUsize>,
}

impl BinaryRx {
    pub async fn recv(&mut self) -> Option<Bytes> {
        let bytes = self.rx.recv().await?;
        self.buffered.fetch_sub(bytes.len(), Ordering::Relaxed);
        Some(bytes)
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        let bytes = self.rx.try_recv().ok()?;
        self.buffered.fetch_sub(bytes.len(), Ordering::Relaxed);
        Some(bytes)
    }
}

pub fn binary_channel() -> (BinaryTx, BinaryRx) {
    let (tx, rx) = mpsc::channel(BINARY_CHANNEL_CAPACITY);
    let buffered = Arc::new(AtomicUsize::new(0));
    (
        BinaryTx {
            tx,
            buffered: buffered.clone(),
        },
        BinaryRx { rx, buffered },
    )
}

/// One quantized waterfall row for one client; `quantized` is the
/// level-concatenated buffer shared by every client on this frame.
#[derive(Clone)]
pub struct WaterfallJob {
    pub frame_num: u64,
    pub level: usize,
    pub l: usize,
    pub r: usize,
    pub quantized_offset: usize,
    pub quantized: Arc<Vec<i8>>,
}

#[derive(Clone)]
pub struct WaterfallTx {
    tx: mpsc::Sender<WaterfallJob>,
    buffered: Arc<AtomicUsize>,
}

impl WaterfallTx {
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn send_job(&self, job: WaterfallJob) -> SendOutcome {
        if self.tx.is_closed() {
            return SendOutcome::Closed;
        }
        let len = job.r.saturating_sub(job.l);
        if self.buffered.load(Ordering::Relaxed) + len > MAX_OUTBOUND_BUFFERED {
            return SendOutcome::Dropped;
        }
        self.buffered.fetch_add(len, Ordering::Relaxed);
        match self.tx.try_send(job) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(j)) => {
                self.buffered
                    .fetch_sub(j.r.saturating_sub(j.l), Ordering::Relaxed);
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(j)) => {
                self.buffered
                    .fetch_sub(j.r.saturating_sub(j.l), Ordering::Relaxed);
                SendOutcome::Closed
            }
        }
    }
}

pub struct WaterfallRx {
    rx: mpsc::Receiver<WaterfallJob>,
    buffered: Arc<AtomicUsize>,
}

impl WaterfallRx {
    pub async fn recv(&mut self) -> Option<WaterfallJob> {
        let job = self.rx.recv().await?;
        self.buffered
            .fetch_sub(job.r.saturating_sub(job.l), Ordering::Relaxed);
        Some(job)
    }
}

pub fn waterfall_channel() -> (WaterfallTx, WaterfallRx) {
    let (tx, rx) = mpsc::channel(WATERFALL_CHANNEL_CAPACITY);
    let buffered = Arc::new(AtomicUsize::new(0));
    (
        WaterfallTx {
            tx,
            buffered: buffered.clone(),
        },
        WaterfallRx { rx, buffered },
    )
}

#[derive(Debug, Clone)]
pub struct AudioParams {
    pub l: i32,
    pub r: i32,
    pub m: f64,
    pub mode: DemodulationMode,
    pub am_stereo: bool,
    pub mute: bool,
    pub agc_enabled: bool,
    pub noise_gate_enabled: bool,
    pub noise_gate_preset: GatePreset,
    pub user_id: String,
    pub last_mode_change: Option<std::time::Instant>,
}

impl AudioParams {
    pub fn tuning(&self) -> TuningParams {
        TuningParams {
            l: self.l,
            r: self.r,
            m: self.m,
            mode: self.mode,
            am_stereo: self.am_stereo,
            mute: self.mute,
            agc_enabled: self.agc_enabled,
        }
    }
}

pub struct AudioSession {
    pub id: ClientId,
    pub unique_id: String,
    pub tx: BinaryTx,
    pub params: Mutex<AudioParams>,
    pub pipeline: Mutex<AudioPipeline>,
    pub throttle: Mutex<ThrottleState>,
}

fn recover<'a, T>(res: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>, what: &str) -> MutexGuard<'a, T> {
    match res {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::error!(what, "mutex poisoned; recovering");
            poisoned.into_inner()
        }
    }
}

impl AudioSession {
    pub fn lock_params(&self) -> MutexGuard<'_, AudioParams> {
        recover(self.params.lock(), "audio params")
    }

    pub fn lock_pipeline(&self) -> MutexGuard<'_, AudioPipeline> {
        recover(self.pipeline.lock(), "audio pipeline")
    }

    pub fn lock_throttle(&self) -> MutexGuard<'_, ThrottleState> {
        recover(self.throttle.lock(), "audio throttle")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaterfallParams {
    pub level: usize,
    pub l: usize,
    pub r: usize,
}

pub struct WaterfallClient {
    pub tx: WaterfallTx,
    pub params: Mutex<WaterfallParams>,
    pub throttle: Mutex<ThrottleState>,
}

impl WaterfallClient {
    pub fn lock_params(&self) -> MutexGuard<'_, WaterfallParams> {
        recover(self.params.lock(), "waterfall params")
    }

    pub fn lock_throttle(&self) -> MutexGuard<'_, ThrottleState> {
        recover(self.throttle.lock(), "waterfall throttle")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub username: String,
    pub message: String,
    pub timestamp: String,
    pub user_id: String,
    pub r#type: String,
    pub reply_to_id: String,
    pub reply_to_username: String,
}

pub struct AppState {
    pub cfg: Config,
    pub rt: Arc<Runtime>,
    pub flac_mode: FlacMode,
    pub html_root: PathBuf,
    pub registry: SignalRegistry,
    /// One map per downsample level, like the quantized buffer itself.
    pub waterfall_clients: Vec<DashMap<ClientId, Arc<WaterfallClient>>>,
    pub event_clients: DashMap<ClientId, TextTx>,
    pub chat_clients: DashMap<ClientId, TextTx>,
    pub chat_history: tokio::sync::Mutex<VecDeque<ChatMessage>>,
    signal_changes: Mutex<HashMap<String, (i32, f64, i32)>>,
    pub total_audio_bits: AtomicUsize,
    pub total_waterfall_bits: AtomicUsize,
    audio_kbits: AtomicU64,
    waterfall_kbits: AtomicU64,
    next_client_id: AtomicU64,
    ws_ip_counts: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl AppState {
    pub fn new(cfg: Config, rt: Runtime) -> Arc<Self> {
        let html_root = PathBuf::from(cfg.server.html_root.clone());
        let waterfall_clients = (0..rt.downsample_levels).map(|_| DashMap::new()).collect();
        Arc::new(Self {
            cfg,
            rt: Arc::new(rt),
            flac_mode: FlacMode::from_env(),
            html_root,
            registry: SignalRegistry::default(),
            waterfall_clients,
            event_clients: DashMap::new(),
            chat_clients: DashMap::new(),
            chat_history: tokio::sync::Mutex::new(VecDeque::with_capacity(CHAT_HISTORY_LEN)),
            signal_changes: Mutex::new(HashMap::new()),
            total_audio_bits: AtomicUsize::new(0),
            total_waterfall_bits: AtomicUsize::new(0),
            audio_kbits: AtomicU64::new(0),
            waterfall_kbits: AtomicU64::new(0),
            next_client_id: AtomicU64::new(1),
            ws_ip_counts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn alloc_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn try_acquire_ws_ip(&self, ip: IpAddr) -> Option<WsIpGuard> {
        let mut counts = recover(self.ws_ip_counts.lock(), "ws ip counts");
        let count = counts.entry(ip).or_insert(0);
        if *count >= self.cfg.limits.ws_per_ip {
            return None;
        }
        *count += 1;
        Some(WsIpGuard {
            counts: self.ws_ip_counts.clone(),
            ip,
        })
    }

    /// Queues a tuning change for the next events tick. The `(-1, -1, -1)`
    /// sentinel marks a disconnect.
    pub fn broadcast_signal_changes(&self, unique_id: &str, l: i32, m: f64, r: i32) {
        if !self.rt.show_other_users {
            return;
        }
        let mut changes = recover(self.signal_changes.lock(), "signal changes");
        changes.insert(unique_id.to_string(), (l, m, r));
    }

    pub fn take_signal_changes(&self) -> HashMap<String, (i32, f64, i32)> {
        let mut changes = recover(self.signal_changes.lock(), "signal changes");
        std::mem::take(&mut *changes)
    }

    /// Full snapshot of live subscriptions, for a freshly connected events
    /// client.
    pub fn snapshot_signal_changes(&self) -> HashMap<String, (i32, f64, i32)> {
        let mut snapshot = HashMap::new();
        if !self.rt.show_other_users {
            return snapshot;
        }
        for (key, session) in self.registry.snapshot() {
            let m = session.lock_params().m;
            snapshot.insert(session.unique_id.clone(), (key.l, m, key.r));
        }
        snapshot
    }

    pub fn total_waterfall_clients(&self) -> usize {
        self.waterfall_clients.iter().map(|m| m.len()).sum()
    }

    /// Once-per-second gauge update: drains the bit counters into kbit/s.
    pub fn update_kbits_gauges(&self) {
        let audio_bits = self.total_audio_bits.swap(0, Ordering::Relaxed);
        let waterfall_bits = self.total_waterfall_bits.swap(0, Ordering::Relaxed);
        self.audio_kbits
            .store((audio_bits as f64 / 1000.0).to_bits(), Ordering::Relaxed);
        self.waterfall_kbits
            .store((waterfall_bits as f64 / 1000.0).to_bits(), Ordering::Relaxed);
    }

    pub fn audio_kbits(&self) -> f64 {
        f64::from_bits(self.audio_kbits.load(Ordering::Relaxed))
    }

    pub fn waterfall_kbits(&self) -> f64 {
        f64::from_bits(self.waterfall_kbits.load(Ordering::Relaxed))
    }

    pub fn event_info(
        &self,
        signal_changes: Option<HashMap<String, (i32, f64, i32)>>,
    ) -> EventsInfo {
        EventsInfo {
            waterfall_clients: self.total_waterfall_clients(),
            signal_clients: self.registry.len(),
            signal_changes,
            waterfall_kbits: self.waterfall_kbits(),
            audio_kbits: self.audio_kbits(),
        }
    }

    /// Settings handshake for the audio and waterfall sockets.
    pub fn basic_info_json(&self) -> String {
        let rt = self.rt.as_ref();
        let info = BasicInfo {
            sps: rt.sps,
            audio_max_sps: rt.audio_max_sps,
            audio_max_fft: rt.audio_max_fft_size,
            fft_size: rt.fft_size,
            fft_result_size: rt.fft_result_size,
            waterfall_size: rt.min_waterfall_fft,
            basefreq: rt.basefreq,
            total_bandwidth: rt.total_bandwidth,
            defaults: BasicInfoDefaults {
                frequency: rt.default_frequency,
                modulation: rt.default_mode_str.clone(),
                l: rt.default_l,
                m: rt.default_m,
                r: rt.default_r,
            },
            waterfall_compression: "zstd".to_string(),
            audio_compression: rt.audio_compression.as_str().to_string(),
            grid_locator: self.cfg.websdr.grid_locator.clone(),
        };
        match serde_json::to_string(&info) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = ?e, "failed to serialize basic info");
                "{}".to_string()
            }
        }
    }
}

pub struct WsIpGuard {
    counts: Arc<Mutex<HashMap<IpAddr, usize>>>,
    ip: IpAddr,
}

impl Drop for WsIpGuard {
    fn drop(&mut self) {
        let mut counts = recover(self.counts.lock(), "ws ip counts");
        if let Some(count) = counts.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.ip);
            }
        }
    }
}

/// Appends to the chat ring, rotating the oldest message out when full.
pub async fn append_chat_message(state: &Arc<AppState>, msg: ChatMessage) {
    let mut history = state.chat_history.lock().await;
    if history.len() >= CHAT_HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_channel_tracks_buffered_bytes_and_caps() {
        let (tx, mut rx) = binary_channel();
        assert_eq!(tx.buffered_bytes(), 0);
        assert_eq!(tx.send_packet(Bytes::from(vec![0u8; 1000])), SendOutcome::Sent);
        assert_eq!(tx.buffered_bytes(), 1000);

        // Past the cap the packet is dropped, not queued.
        assert_eq!(
            tx.send_packet(Bytes::from(vec![0u8; MAX_OUTBOUND_BUFFERED])),
            SendOutcome::Dropped
        );
        assert_eq!(tx.buffered_bytes(), 1000);

        let received = rx.rx.try_recv().unwrap();
        tx.buffered.fetch_sub(received.len(), Ordering::Relaxed);
        assert_eq!(tx.buffered_bytes(), 0);
    }

    #[test]
    fn closed_channel_reports_closed() {
        let (tx, rx) = binary_channel();
        drop(rx);
        assert_eq!(tx.send_packet(Bytes::from_static(b"x")), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn chat_ring_rotates_oldest_out() {
        let cfg: Config = serde_json::from_str(
            r#"{"input":{"sps":2400000,"frequency":0,"signal":"real","fft_size":131072}}"#,
        )
        .unwrap();
        let rt = cfg.runtime().unwrap();
        let state = AppState::new(cfg, rt);
        for i in 0..(CHAT_HISTORY_LEN + 5) {
            append_chat_message(
                &state,
                ChatMessage {
                    id: i.to_string(),
                    username: "user".into(),
                    message: format!("msg {i}"),
                    timestamp: String::new(),
                    user_id: "u".into(),
                    r#type: "message".into(),
                    reply_to_id: String::new(),
                    reply_to_username: String::new(),
                },
            )
            .await;
        }
        let history = state.chat_history.lock().await;
        assert_eq!(history.len(), CHAT_HISTORY_LEN);
        assert_eq!(history.front().unwrap().id, "5");
        assert_eq!(history.back().unwrap().id, (CHAT_HISTORY_LEN + 4).to_string());
    }

    #[test]
    fn ws_ip_guard_releases_on_drop() {
        let cfg: Config = serde_json::from_str(
            r#"{"limits":{"ws_per_ip":2},"input":{"sps":2400000,"frequency":0,"signal":"real","fft_size":131072}}"#,
        )
        .unwrap();
        let rt = cfg.runtime().unwrap();
        let state = AppState::new(cfg, rt);
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        let g1 = state.try_acquire_ws_ip(ip).unwrap();
        let _g2 = state.try_acquire_ws_ip(ip).unwrap();
        assert!(state.try_acquire_ws_ip(ip).is_none());
        drop(g1);
        assert!(state.try_acquire_ws_ip(ip).is_some());
    }
}
