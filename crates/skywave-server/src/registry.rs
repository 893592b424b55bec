//! Ordered subscription registry keyed by frequency slice.
//!
//! The map key carries the client id so overlapping slices coexist
//! (multimap semantics); iteration order stays sorted by `(l, r)`, which the
//! dispatcher walks once per spectrum frame. Tuning changes re-key the entry
//! with a remove+insert pair under the same lock, so the registry and the
//! session params can never disagree for longer than one critical section.

use crate::state::{AudioSession, ClientId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SliceKey {
    pub l: i32,
    pub r: i32,
    pub id: ClientId,
}

#[derive(Default)]
pub struct SignalRegistry {
    inner: Mutex<BTreeMap<SliceKey, Arc<AudioSession>>>,
}

impl SignalRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<SliceKey, Arc<AudioSession>>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::error!("signal registry mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Inserts the session under its current tuning window.
    pub fn insert(&self, session: &Arc<AudioSession>) {
        let mut map = self.lock();
        let p = session.lock_params();
        let key = SliceKey {
            l: p.l,
            r: p.r,
            id: session.id,
        };
        drop(p);
        map.insert(key, session.clone());
    }

    pub fn remove(&self, session: &AudioSession) {
        let mut map = self.lock();
        let p = session.lock_params();
        let key = SliceKey {
            l: p.l,
            r: p.r,
            id: session.id,
        };
        drop(p);
        map.remove(&key);
    }

    /// Moves the session to a new window: extract, update params, reinsert.
    /// Both the map and the session see the change atomically with respect
    /// to other registry users.
    pub fn rekey(&self, session: &Arc<AudioSession>, new_l: i32, new_r: i32, new_m: f64) {
        let mut map = self.lock();
        let mut p = session.lock_params();
        let old_key = SliceKey {
            l: p.l,
            r: p.r,
            id: session.id,
        };
        p.l = new_l;
        p.r = new_r;
        p.m = new_m;
        drop(p);
        let entry = map.remove(&old_key);
        let new_key = SliceKey {
            l: new_l,
            r: new_r,
            id: session.id,
        };
        match entry {
            Some(s) => {
                map.insert(new_key, s);
            }
            None => {
                // Session was not registered (already closed); nothing to move.
                tracing::warn!(id = session.id, "rekey on unregistered session");
            }
        }
    }

    /// Sorted snapshot for one dispatch walk.
    pub fn snapshot(&self) -> Vec<(SliceKey, Arc<AudioSession>)> {
        self.lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{binary_channel, AudioParams};
    use crate::throttle::ThrottleState;
    use skywave_core::codec::flac_stream::FlacMode;
    use skywave_core::codec::AudioCodec;
    use skywave_core::dsp::demod::DemodulationMode;
    use skywave_core::dsp::noise_gate::GatePreset;
    use skywave_core::pipeline::AudioPipeline;

    fn session(id: ClientId, l: i32, r: i32) -> Arc<AudioSession> {
        let (tx, _rx) = binary_channel();
        Arc::new(AudioSession {
            id,
            unique_id: format!("session-{id}"),
            tx,
            params: Mutex::new(AudioParams {
                l,
                r,
                m: f64::from(l),
                mode: DemodulationMode::Usb,
                am_stereo: false,
                mute: false,
                agc_enabled: true,
                noise_gate_enabled: false,
                noise_gate_preset: GatePreset::Balanced,
                user_id: String::new(),
                last_mode_change: None,
            }),
            pipeline: Mutex::new(
                AudioPipeline::new(12_000, 64, true, AudioCodec::Flac, FlacMode::Balanced)
                    .unwrap(),
            ),
            throttle: Mutex::new(ThrottleState::default()),
        })
    }

    #[test]
    fn keys_track_params_through_rekeys() {
        let registry = SignalRegistry::default();
        let a = session(1, 100, 200);
        let b = session(2, 100, 200);
        registry.insert(&a);
        registry.insert(&b);
        assert_eq!(registry.len(), 2, "overlapping slices must coexist");

        registry.rekey(&a, 300, 400, 350.0);
        registry.rekey(&b, 50, 80, 60.0);
        registry.rekey(&a, 500, 600, 550.0);

        for (key, session) in registry.snapshot() {
            let p = session.lock_params();
            assert_eq!((key.l, key.r), (p.l, p.r), "key diverged from params");
            assert_eq!(key.id, session.id);
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn snapshot_is_sorted_by_slice() {
        let registry = SignalRegistry::default();
        registry.insert(&session(1, 500, 600));
        registry.insert(&session(2, 100, 200));
        registry.insert(&session(3, 300, 400));
        let keys: Vec<i32> = registry.snapshot().iter().map(|(k, _)| k.l).collect();
        assert_eq!(keys, vec![100, 300, 500]);
    }

    #[test]
    fn remove_uses_current_key() {
        let registry = SignalRegistry::default();
        let s = session(7, 10, 20);
        registry.insert(&s);
        registry.rekey(&s, 30, 40, 35.0);
        registry.remove(&s);
        assert!(registry.is_empty());
    }
}
