//! # Retry Actor
//!
//! Background actor that periodically drains the offline queue,
//! independent of the sampling cadence.
//!
//! A drain pass reads, compresses and fsyncs on the calling thread, so the
//! actor gets a thread and a single-threaded runtime of its own. The
//! sampling loop never shares a worker with it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::OfflineQueue;
use crate::publisher::Transport;
use crate::shutdown::ShutdownFlag;

/// Retry actor cadence
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    /// Time between drain passes
    pub interval: Duration,
    /// How often the shutdown flag is checked between passes
    pub poll: Duration,
}

/// Run drain passes every `schedule.interval` until shutdown is requested
///
/// The first pass happens one full interval after start. A pass already in
/// progress is completed before the flag is seen; its sends are bounded by
/// the batch timeouts.
pub async fn run_retry_actor(
    queue: Arc<OfflineQueue>,
    transport: Arc<dyn Transport>,
    schedule: RetrySchedule,
    shutdown: ShutdownFlag,
) {
    info!("Retry actor started (every {:?})", schedule.interval);
    let mut next_pass = Instant::now() + schedule.interval;

    while !shutdown.is_requested() {
        if Instant::now() >= next_pass {
            match queue.process(transport.as_ref()).await {
                Ok(report) if report.is_idle() => debug!("Offline queue empty"),
                Ok(_) => {}
                Err(e) => warn!("Offline queue drain failed: {}", e),
            }
            next_pass = Instant::now() + schedule.interval;
        }

        tokio::time::sleep(schedule.poll).await;
    }

    info!("Retry actor stopped");
}

/// Run [`run_retry_actor`] on a dedicated `offline-retry` thread
///
/// The thread returns once shutdown is requested and the current pass, if
/// any, has finished.
///
/// # Errors
///
/// Returns an I/O error if the thread cannot be spawned.
pub fn spawn_retry_thread(
    queue: Arc<OfflineQueue>,
    transport: Arc<dyn Transport>,
    schedule: RetrySchedule,
    shutdown: ShutdownFlag,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("offline-retry".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Retry actor runtime failed to start: {}", e);
                    return;
                }
            };
            runtime.block_on(run_retry_actor(queue, transport, schedule, shutdown));
        })
}
