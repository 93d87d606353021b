//! # Shared State
//!
//! The one object every actor shares: immutable channel settings plus a
//! single lock over the measurement table, the last position fix and the
//! pending calibration slot.
//!
//! The lock is only held for short copies in and out. Nothing blocking,
//! whether operator input or a network send, happens while it is held.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::measurement::{Correction, Measurement, MeasurementSetting, PositionFix};

/// Data guarded by the shared lock
#[derive(Debug, Clone)]
pub struct ChannelTable {
    pub measurements: Vec<Measurement>,
    pub position: Option<PositionFix>,
    pub pending_calibration: Option<usize>,
}

/// Copy of the guarded data taken for one publish
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub measurements: Vec<Measurement>,
    pub position: Option<PositionFix>,
}

/// State shared by the sampling loop, the calibration listener and tests
#[derive(Debug)]
pub struct SharedState {
    settings: Vec<MeasurementSetting>,
    table: Mutex<ChannelTable>,
}

impl SharedState {
    /// Build the measurement table from the configured settings
    #[must_use]
    pub fn new(settings: Vec<MeasurementSetting>) -> Self {
        let measurements = settings.iter().map(Measurement::from_setting).collect();
        Self {
            settings,
            table: Mutex::new(ChannelTable {
                measurements,
                position: None,
                pending_calibration: None,
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &[MeasurementSetting] {
        &self.settings
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.settings.len()
    }

    /// Store a calibration request
    ///
    /// Returns `false` and leaves the slot alone if a request is already pending.
    pub fn request_calibration(&self, channel: usize) -> bool {
        let mut table = self.lock();
        if table.pending_calibration.is_some() {
            return false;
        }
        table.pending_calibration = Some(channel);
        true
    }

    #[must_use]
    pub fn pending_calibration(&self) -> Option<usize> {
        self.lock().pending_calibration
    }

    pub fn clear_calibration(&self) {
        self.lock().pending_calibration = None;
    }

    /// Install a new correction and clear the pending slot in one critical section
    pub fn install_correction(&self, channel: usize, correction: Correction) -> bool {
        let mut table = self.lock();
        table.pending_calibration = None;
        match table.measurements.get_mut(channel) {
            Some(measurement) => {
                measurement.correction = correction;
                true
            }
            None => false,
        }
    }

    /// Current correction of `channel`
    #[must_use]
    pub fn correction(&self, channel: usize) -> Option<Correction> {
        self.lock().measurements.get(channel).map(|m| m.correction)
    }

    /// Store the raw values of one sampling tick
    ///
    /// `samples` holds `(channel, raw)` pairs; `fix` replaces the stored
    /// position when present.
    pub fn record_samples(&self, samples: &[(usize, i32)], fix: Option<PositionFix>) {
        let mut table = self.lock();
        for &(channel, raw) in samples {
            if let Some(measurement) = table.measurements.get_mut(channel) {
                measurement.raw_value = raw;
            }
        }
        if fix.is_some() {
            table.position = fix;
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let table = self.lock();
        Snapshot {
            measurements: table.measurements.clone(),
            position: table.position,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
