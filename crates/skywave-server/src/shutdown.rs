//! Coordinated shutdown: one flag shared between the async side (axum's
//! graceful-shutdown future) and the blocking spectrum reader thread, which
//! polls it between frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Short grace period so frames already handed to the worker pool reach the
/// websocket senders before axum tears the connections down.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

pub fn is_shutdown_requested() -> bool {
    STOP_REQUESTED.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    STOP_REQUESTED.store(true, Ordering::Relaxed);
}

/// Resolves once a termination signal arrives and the drain grace period
/// has passed. Handed to axum as the graceful-shutdown future.
pub async fn shutdown_signal() {
    wait_for_signal().await;
    request_shutdown();
    tracing::info!("shutdown requested; stopping spectrum input and draining senders");
    tokio::time::sleep(DRAIN_GRACE).await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = async {
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                tracing::error!(error = ?e, "failed to install ctrl-c handler");
            }
        }
        _ = sigterm => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "failed to install ctrl-c handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_flag_is_visible_to_pollers() {
        assert!(!is_shutdown_requested());
        request_shutdown();
        assert!(is_shutdown_requested());
        STOP_REQUESTED.store(false, Ordering::Relaxed);
    }
}
