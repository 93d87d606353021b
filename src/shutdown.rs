//! # Shutdown
//!
//! Cooperative stop request shared by every actor.
//!
//! Signal handling only sets the flag. Each actor polls it once per
//! iteration and returns on its own, releasing what it holds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared stop request
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every actor to stop; idempotent
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Wait for Ctrl+C (or SIGTERM on Unix) and raise the flag
///
/// Returns once the flag is set, either by a signal or by another caller.
pub async fn watch_signals(flag: ShutdownFlag) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, shutting down"),
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            }
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down");
        }
    }
    flag.request();
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
