//! # Coordinator
//!
//! Owns the sampling/publish loop and supervises the two background
//! actors: the calibration listener and the offline queue retry actor.
//!
//! ## Loop
//!
//! Every sample tick the raw values of all active channels are stored in
//! the shared table. On the longer publish interval one record is built
//! and sent; a failed send goes to the offline queue. When a calibration
//! request is pending, sampling and publishing are suspended while the
//! calibration phases run:
//!
//! ```text
//! Sampling -> AwaitingCalibrationPoints -> InstallingCorrection -> Sampling
//!                       |                          |
//!                       +--------- abort ----------+--> Sampling
//! ```
//!
//! ## Shutdown
//!
//! The loop exits once the shutdown flag is seen. It then waits for both
//! actors and releases its resources in reverse order of acquisition.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::calibration::listener::{run_listener, INPUT_QUEUE_DEPTH};
use crate::calibration::report::write_report;
use crate::calibration::{least_squares, CalibrationPoint, CalibrationSession, Step};
use crate::config::{CalibrationConfig, Config, TimingConfig};
use crate::error::{Result, UplinkError};
use crate::line_protocol::RecordTemplate;
use crate::measurement::Correction;
use crate::publisher::Transport;
use crate::queue::retry::{spawn_retry_thread, RetrySchedule};
use crate::queue::OfflineQueue;
use crate::shutdown::ShutdownFlag;
use crate::sources::{NoPosition, PositionSource, SampleSource, SimulatedSource};
use crate::state::SharedState;

/// Number of publishes between status log messages
pub const LOG_INTERVAL_PUBLISHES: u64 = 120;

/// Loop cadences
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub sample: Duration,
    pub publish: Duration,
    pub queue_interval: Duration,
    pub poll: Duration,
}

impl From<&TimingConfig> for Timing {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            sample: timing.sample_interval(),
            publish: timing.publish_interval(),
            queue_interval: timing.queue_interval(),
            poll: timing.shutdown_poll(),
        }
    }
}

#[derive(Debug, Clone)]
struct CalibrationOptions {
    enabled: bool,
    report_dir: PathBuf,
    min_points: usize,
}

impl From<&CalibrationConfig> for CalibrationOptions {
    fn from(calibration: &CalibrationConfig) -> Self {
        Self {
            enabled: calibration.enabled,
            report_dir: PathBuf::from(&calibration.report_dir),
            min_points: calibration.min_points,
        }
    }
}

/// Counters reported in the periodic status line and at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub queued: u64,
    pub dropped: u64,
    pub calibrations: u64,
}

impl PublishStats {
    fn attempts(&self) -> u64 {
        self.published + self.queued + self.dropped
    }
}

/// What happened to one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the collector
    Sent,
    /// Send failed; record stored for retry
    Queued,
    /// Record could not be encoded or stored
    Dropped,
}

enum Phase {
    Sampling,
    AwaitingCalibrationPoints(CalibrationSession),
    InstallingCorrection {
        channel: usize,
        points: Vec<CalibrationPoint>,
    },
}

/// Sampling loop and actor supervisor
pub struct Coordinator {
    state: Arc<SharedState>,
    template: RecordTemplate,
    queue: Arc<OfflineQueue>,
    transport: Arc<dyn Transport>,
    sampler: Box<dyn SampleSource>,
    position: Box<dyn PositionSource>,
    timing: Timing,
    calibration: CalibrationOptions,
    shutdown: ShutdownFlag,
    stats: PublishStats,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("timing", &self.timing)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator over `state`
    ///
    /// Samples come from a [`SimulatedSource`] and no position is published
    /// until other sources are installed with [`Coordinator::with_sampler`]
    /// and [`Coordinator::with_position`].
    #[must_use]
    pub fn new(
        config: &Config,
        state: Arc<SharedState>,
        queue: Arc<OfflineQueue>,
        transport: Arc<dyn Transport>,
        shutdown: ShutdownFlag,
    ) -> Self {
        let tags = vec![("source".to_string(), config.record.source.clone())];
        let template = RecordTemplate::new(&config.record.measurement, tags, state.settings());

        Self {
            state,
            template,
            queue,
            transport,
            sampler: Box::new(SimulatedSource::default()),
            position: Box::new(NoPosition),
            timing: Timing::from(&config.timing),
            calibration: CalibrationOptions::from(&config.calibration),
            shutdown,
            stats: PublishStats::default(),
        }
    }

    #[must_use]
    pub fn with_sampler(mut self, sampler: Box<dyn SampleSource>) -> Self {
        self.sampler = sampler;
        self
    }

    #[must_use]
    pub fn with_position(mut self, position: Box<dyn PositionSource>) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    /// Read every active channel and the position fix into the shared table
    ///
    /// Hardware reads happen before the lock is taken. A channel that fails
    /// to read keeps its previous value.
    pub fn sample_once(&mut self) {
        let mut samples = Vec::with_capacity(self.state.channel_count());
        for (channel, setting) in self.state.settings().iter().enumerate() {
            if !setting.is_active() {
                continue;
            }
            match self.sampler.read_raw(channel) {
                Ok(raw) => samples.push((channel, raw)),
                Err(e) => warn!("Failed to read channel {} ({}): {}", channel, setting.id, e),
            }
        }

        let fix = self.position.latest_fix();
        self.state.record_samples(&samples, fix);
    }

    /// Build one record from the current table and try to deliver it
    ///
    /// A failed send stores the record in the offline queue. Nothing here
    /// is fatal; every failure ends up in the returned outcome.
    pub async fn publish_once(&mut self) -> PublishOutcome {
        let snapshot = self.state.snapshot();
        let record = match self.template.build(
            self.state.settings(),
            &snapshot.measurements,
            snapshot.position.as_ref(),
            Utc::now().timestamp(),
        ) {
            Ok(record) => record,
            Err(e) => {
                warn!("Record dropped: {}", e);
                self.stats.dropped += 1;
                return PublishOutcome::Dropped;
            }
        };
        debug!("Publishing {}", record);

        let sent = self.transport.send(&record).await;
        let outcome = match sent {
            Ok(()) => PublishOutcome::Sent,
            Err(e) => {
                warn!("Send failed, queueing record: {}", e);
                // The append fsyncs and may wait for a drain to swap the store
                let queue = Arc::clone(&self.queue);
                match tokio::task::spawn_blocking(move || queue.add(&record)).await {
                    Ok(Ok(())) => PublishOutcome::Queued,
                    Ok(Err(e)) => {
                        error!("Record lost, offline queue unavailable: {}", e);
                        PublishOutcome::Dropped
                    }
                    Err(e) => {
                        error!("Record lost, queue append did not complete: {}", e);
                        PublishOutcome::Dropped
                    }
                }
            }
        };

        match outcome {
            PublishOutcome::Sent => self.stats.published += 1,
            PublishOutcome::Queued => self.stats.queued += 1,
            PublishOutcome::Dropped => self.stats.dropped += 1,
        }
        outcome
    }

    /// Run the calibration phases for `channel`
    ///
    /// Values arrive on `points`: first the number of points, then one
    /// ground-truth value per point, each paired with a fresh raw sample.
    /// On success the new correction is installed and the pending slot
    /// cleared under one lock. On any abort the slot is cleared and the
    /// existing correction is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`UplinkError::Calibration`] when the channel cannot be
    /// calibrated, the input is invalid, the fit is degenerate, or shutdown
    /// is requested mid-way.
    pub async fn calibrate(
        &mut self,
        channel: usize,
        points: &mut mpsc::Receiver<f64>,
    ) -> Result<Correction> {
        let result = self.run_phases(channel, points).await;

        match &result {
            Ok(correction) => {
                self.stats.calibrations += 1;
                info!(
                    "Channel {} calibrated: slope = {:.6}, offset = {:.6}",
                    channel, correction.slope, correction.offset
                );
            }
            Err(e) => {
                self.state.clear_calibration();
                warn!("Calibration of channel {} aborted: {}", channel, e);
            }
        }

        while let Ok(value) = points.try_recv() {
            debug!("Discarding leftover calibration input {}", value);
        }
        result
    }

    async fn run_phases(
        &mut self,
        channel: usize,
        points: &mut mpsc::Receiver<f64>,
    ) -> Result<Correction> {
        let mut phase = self.begin_calibration(channel)?;
        let mut installed = None;

        loop {
            phase = match phase {
                Phase::AwaitingCalibrationPoints(session) => {
                    self.await_point(session, points).await?
                }
                Phase::InstallingCorrection { channel, points } => {
                    installed = Some(self.install_correction(channel, &points)?);
                    Phase::Sampling
                }
                Phase::Sampling => {
                    return installed.ok_or_else(|| {
                        UplinkError::Calibration("session ended without a fit".to_string())
                    });
                }
            };
        }
    }

    fn begin_calibration(&self, channel: usize) -> Result<Phase> {
        let Some(setting) = self.state.settings().get(channel) else {
            return Err(UplinkError::Calibration(format!(
                "channel {} does not exist ({} configured)",
                channel,
                self.state.channel_count()
            )));
        };
        if !setting.is_active() {
            return Err(UplinkError::Calibration(format!("channel {} is not connected", channel)));
        }

        info!(
            "Calibrating channel {} ({}). Enter the number of points (at least {}):",
            channel, setting.id, self.calibration.min_points
        );
        Ok(Phase::AwaitingCalibrationPoints(CalibrationSession::new(
            channel,
            self.calibration.min_points,
        )))
    }

    async fn await_point(
        &mut self,
        mut session: CalibrationSession,
        points: &mut mpsc::Receiver<f64>,
    ) -> Result<Phase> {
        let value = loop {
            if self.shutdown.is_requested() {
                return Err(UplinkError::Calibration("shutdown requested".to_string()));
            }
            tokio::select! {
                value = points.recv() => match value {
                    Some(value) => break value,
                    None => {
                        return Err(UplinkError::Calibration("operator input closed".to_string()));
                    }
                },
                _ = tokio::time::sleep(self.timing.poll) => {}
            }
        };

        let channel = session.channel();
        let step = if session.needs_count() {
            session.accept_count(value)
        } else {
            let raw = self.sampler.read_raw(channel)?;
            info!("Channel {} raw reading {} paired with {}", channel, raw, value);
            session.accept_point(raw, value)
        };

        match step {
            Step::Continue => {
                if let Some(remaining) = session.remaining() {
                    info!("Set the reference and enter its value ({} left):", remaining);
                }
                Ok(Phase::AwaitingCalibrationPoints(session))
            }
            Step::Complete(points) => Ok(Phase::InstallingCorrection { channel, points }),
            Step::Abort(reason) => Err(UplinkError::Calibration(reason)),
        }
    }

    fn install_correction(&self, channel: usize, points: &[CalibrationPoint]) -> Result<Correction> {
        let correction = least_squares(points)?;
        self.state.install_correction(channel, correction);

        let id = self
            .state
            .settings()
            .get(channel)
            .map(|s| s.id.as_str())
            .unwrap_or_default();
        match write_report(&self.calibration.report_dir, channel, id, points, correction) {
            Ok(path) => info!("Calibration report written to {}", path.display()),
            Err(e) => warn!("Failed to write calibration report: {}", e),
        }

        Ok(correction)
    }

    /// Run until shutdown is requested
    ///
    /// `operator_lines` feeds the calibration listener; pass `None` (or
    /// disable calibration in the config) to run without one.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the retry actor thread cannot be started.
    /// Steady-state problems are logged and counted instead.
    pub async fn run(mut self, operator_lines: Option<mpsc::Receiver<String>>) -> Result<PublishStats> {
        let retry = spawn_retry_thread(
            Arc::clone(&self.queue),
            Arc::clone(&self.transport),
            RetrySchedule {
                interval: self.timing.queue_interval,
                poll: self.timing.poll,
            },
            self.shutdown.clone(),
        )?;

        let (points_tx, mut points_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let listener = match operator_lines {
            Some(lines) if self.calibration.enabled => Some(tokio::spawn(run_listener(
                Arc::clone(&self.state),
                lines,
                points_tx,
                self.shutdown.clone(),
                self.timing.poll,
            ))),
            _ => {
                drop(points_tx);
                None
            }
        };

        info!(
            "Sampling every {:?}, publishing every {:?}",
            self.timing.sample, self.timing.publish
        );

        let mut sample_tick = interval(self.timing.sample);
        sample_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next_publish = Instant::now() + self.timing.publish;
        let mut last_log_attempts = 0;

        while !self.shutdown.is_requested() {
            sample_tick.tick().await;
            self.sample_once();

            if let Some(channel) = self.state.pending_calibration() {
                if let Err(e) = self.calibrate(channel, &mut points_rx).await {
                    debug!("Calibration ended without a new correction: {}", e);
                }
                // Publishing restarts a full interval after calibration
                next_publish = Instant::now() + self.timing.publish;
                sample_tick.reset();
                continue;
            }

            if Instant::now() < next_publish {
                continue;
            }
            self.publish_once().await;
            next_publish += self.timing.publish;
            if next_publish < Instant::now() {
                next_publish = Instant::now() + self.timing.publish;
            }

            if self.stats.attempts() - last_log_attempts >= LOG_INTERVAL_PUBLISHES {
                info!(
                    "Published {} records ({} queued, {} dropped)",
                    self.stats.published, self.stats.queued, self.stats.dropped
                );
                last_log_attempts = self.stats.attempts();
            }
        }

        info!("Sampling loop stopped, waiting for background tasks");
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!("Calibration listener ended abnormally: {}", e);
            }
        }
        match tokio::task::spawn_blocking(move || retry.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Retry actor panicked"),
            Err(e) => warn!("Failed to join retry actor: {}", e),
        }

        let stats = self.stats;
        info!(
            "Total: {} published, {} queued, {} dropped, {} calibrations",
            stats.published, stats.queued, stats.dropped, stats.calibrations
        );
        match self.queue.pending() {
            Ok(0) => {}
            Ok(pending) => info!("{} records remain queued for the next run", pending),
            Err(e) => warn!("Cannot count queued records: {}", e),
        }

        self.release(points_rx);
        Ok(stats)
    }

    fn release(self, points_rx: mpsc::Receiver<f64>) {
        let Coordinator {
            state,
            template,
            queue,
            transport,
            sampler,
            position,
            ..
        } = self;

        drop(points_rx);
        drop(position);
        drop(sampler);
        drop(transport);
        drop(queue);
        drop(template);
        drop(state);
    }
}
