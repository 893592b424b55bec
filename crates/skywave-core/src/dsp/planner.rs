//! Shared FFT plan construction.
//!
//! Plan creation is serialized through process-wide planner mutexes so that
//! plans for equal sizes are built once and shared as `Arc`s across
//! subscriptions. Plan *execution* never takes these locks.

use realfft::{ComplexToReal, RealFftPlanner};
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::{Arc, Mutex, OnceLock};

fn complex_planner() -> &'static Mutex<FftPlanner<f32>> {
    static PLANNER: OnceLock<Mutex<FftPlanner<f32>>> = OnceLock::new();
    PLANNER.get_or_init(|| Mutex::new(FftPlanner::new()))
}

fn real_planner() -> &'static Mutex<RealFftPlanner<f32>> {
    static PLANNER: OnceLock<Mutex<RealFftPlanner<f32>>> = OnceLock::new();
    PLANNER.get_or_init(|| Mutex::new(RealFftPlanner::new()))
}

fn lock_complex() -> std::sync::MutexGuard<'static, FftPlanner<f32>> {
    match complex_planner().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn plan_complex(len: usize, direction: FftDirection) -> Arc<dyn Fft<f32>> {
    let mut planner = lock_complex();
    match direction {
        FftDirection::Forward => planner.plan_fft_forward(len),
        FftDirection::Inverse => planner.plan_fft_inverse(len),
    }
}

pub fn plan_inverse_c2c(len: usize) -> Arc<dyn Fft<f32>> {
    plan_complex(len, FftDirection::Inverse)
}

pub fn plan_forward_c2c(len: usize) -> Arc<dyn Fft<f32>> {
    plan_complex(len, FftDirection::Forward)
}

pub fn plan_inverse_c2r(len: usize) -> Arc<dyn ComplexToReal<f32>> {
    let mut planner = match real_planner().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    planner.plan_fft_inverse(len)
}
