//! Adaptive per-connection throttling.
//!
//! Browsers aggressively throttle background tabs; when a client becomes a
//! slow consumer its outbound buffer grows. Hard-dropping everything looks
//! like a freeze to the user, so instead the send rate degrades in steps as
//! buffer pressure rises and ramps back up by itself when the client drains.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Waterfall,
}

const AUDIO_BASE_INTERVAL_MS: u64 = 20;
const WATERFALL_BASE_INTERVAL_MS: u64 = 40;

/// Maps buffer pressure to `(skip_mod, min_interval)`. Audio intervenes
/// earlier with gentler skipping to keep the decoder primed; the waterfall
/// only ever needs its latest line and tolerates heavy decimation.
pub fn plan(kind: StreamKind, buffered_bytes: usize) -> (u64, Duration) {
    let (skip_mod, interval_mult) = match kind {
        StreamKind::Audio => match buffered_bytes {
            b if b > 500_000 => (20, 5),
            b if b > 300_000 => (10, 4),
            b if b > 150_000 => (5, 3),
            b if b > 75_000 => (3, 2),
            b if b > 30_000 => (2, 1),
            _ => (1, 0),
        },
        StreamKind::Waterfall => match buffered_bytes {
            b if b > 700_000 => (30, 6),
            b if b > 400_000 => (15, 4),
            b if b > 200_000 => (8, 3),
            b if b > 100_000 => (4, 2),
            b if b > 50_000 => (2, 1),
            _ => (1, 0),
        },
    };
    let base = match kind {
        StreamKind::Audio => AUDIO_BASE_INTERVAL_MS,
        StreamKind::Waterfall => WATERFALL_BASE_INTERVAL_MS,
    };
    (skip_mod, Duration::from_millis(base * interval_mult))
}

#[derive(Debug, Default)]
pub struct ThrottleState {
    last_frame_sent: u64,
    last_send: Option<Instant>,
}

impl ThrottleState {
    /// Admission decision for one frame. A frame goes out iff it survives
    /// the modulo skip *and* enough time passed since the last send.
    pub fn should_send(
        &mut self,
        kind: StreamKind,
        buffered_bytes: usize,
        frame_num: u64,
        now: Instant,
    ) -> bool {
        let (skip_mod, min_interval) = plan(kind, buffered_bytes);
        if skip_mod == 1 && min_interval.is_zero() {
            return true;
        }

        if frame_num % skip_mod != 0 {
            return false;
        }

        if !min_interval.is_zero() {
            if let Some(last) = self.last_send {
                if now.duration_since(last) < min_interval {
                    return false;
                }
            }
        }

        self.last_send = Some(now);
        self.last_frame_sent = frame_num;
        true
    }

    pub fn last_frame_sent(&self) -> u64 {
        self.last_frame_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pressure_always_sends() {
        let mut st = ThrottleState::default();
        let now = Instant::now();
        for frame in 0..50 {
            assert!(st.should_send(StreamKind::Audio, 0, frame, now));
        }
    }

    #[test]
    fn tiers_are_monotonic_in_buffered_amount() {
        for kind in [StreamKind::Audio, StreamKind::Waterfall] {
            let mut prev = plan(kind, 0);
            for buffered in (0..1_000_000).step_by(1000) {
                let cur = plan(kind, buffered);
                assert!(
                    cur.0 >= prev.0 && cur.1 >= prev.1,
                    "{kind:?}: throttle regressed at {buffered} bytes"
                );
                prev = cur;
            }
        }
    }

    #[test]
    fn moderate_pressure_decimates_to_one_in_five() {
        // 200 kB buffered: skip_mod 5 with a 60 ms floor. At a 20 ms frame
        // cadence, 100 frames degrade to ~20 sends spaced >= 60 ms.
        let mut st = ThrottleState::default();
        let t0 = Instant::now();
        let mut sent = Vec::new();
        for frame in 0..100u64 {
            let now = t0 + Duration::from_millis(20 * frame);
            if st.should_send(StreamKind::Audio, 200_000, frame, now) {
                sent.push((frame, now));
            }
        }
        assert_eq!(sent.len(), 20, "expected one send per five frames");
        for pair in sent.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(60));
            assert_eq!(pair[1].0 % 5, 0);
        }
    }

    #[test]
    fn min_interval_suppresses_bursts() {
        let mut st = ThrottleState::default();
        let t0 = Instant::now();
        // Severe pressure: skip_mod 20, 100 ms interval. Two admissible
        // frames arriving 10 ms apart: only the first goes.
        assert!(st.should_send(StreamKind::Audio, 600_000, 20, t0));
        assert!(!st.should_send(
            StreamKind::Audio,
            600_000,
            40,
            t0 + Duration::from_millis(10)
        ));
        assert!(st.should_send(
            StreamKind::Audio,
            600_000,
            60,
            t0 + Duration::from_millis(150)
        ));
    }

    #[test]
    fn recovery_restores_full_rate() {
        let mut st = ThrottleState::default();
        let t0 = Instant::now();
        assert!(!st.should_send(StreamKind::Waterfall, 750_000, 1, t0));
        // Buffer drained: every frame goes again.
        for frame in 2..10 {
            assert!(st.should_send(StreamKind::Waterfall, 100, frame, t0));
        }
    }
}
