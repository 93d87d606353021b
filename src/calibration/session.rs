//! # Calibration Session
//!
//! Point collection for one channel. The first operator value is the
//! number of points to collect; each following value is the ground truth
//! for one fresh raw sample.

use super::fit::CalibrationPoint;
use crate::config::MAX_CALIBRATION_POINTS;

/// Result of feeding one operator value to a session
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// More input needed
    Continue,
    /// Every requested point has been collected
    Complete(Vec<CalibrationPoint>),
    /// Session cannot continue; the correction must stay untouched
    Abort(String),
}

/// Point collection state for one channel
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSession {
    channel: usize,
    min_points: usize,
    expected: Option<usize>,
    collected: Vec<CalibrationPoint>,
}

impl CalibrationSession {
    /// Start a session for `channel` requiring at least `min_points` points
    #[must_use]
    pub fn new(channel: usize, min_points: usize) -> Self {
        Self {
            channel,
            min_points,
            expected: None,
            collected: Vec::new(),
        }
    }

    #[must_use]
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// True until the point count has been accepted
    #[must_use]
    pub fn needs_count(&self) -> bool {
        self.expected.is_none()
    }

    /// Points still to collect, once the count is known
    #[must_use]
    pub fn remaining(&self) -> Option<usize> {
        self.expected.map(|n| n - self.collected.len())
    }

    /// Accept the operator's point count
    ///
    /// The count must be a whole number between the session minimum and
    /// [`MAX_CALIBRATION_POINTS`].
    pub fn accept_count(&mut self, value: f64) -> Step {
        if value.fract() != 0.0 || !value.is_finite() {
            return Step::Abort(format!("point count {} is not a whole number", value));
        }
        if value < self.min_points as f64 {
            return Step::Abort(format!(
                "at least {} points are needed, got {}",
                self.min_points, value
            ));
        }
        if value > MAX_CALIBRATION_POINTS as f64 {
            return Step::Abort(format!(
                "at most {} points are supported, got {}",
                MAX_CALIBRATION_POINTS, value
            ));
        }

        let count = value as usize;
        self.expected = Some(count);
        self.collected.reserve_exact(count);
        Step::Continue
    }

    /// Record one point pairing a fresh `raw` sample with the operator's `actual` value
    pub fn accept_point(&mut self, raw: i32, actual: f64) -> Step {
        let Some(expected) = self.expected else {
            return Step::Abort("point received before the point count".to_string());
        };
        if !actual.is_finite() {
            return Step::Abort(format!("value {} is not finite", actual));
        }

        self.collected.push(CalibrationPoint { raw, actual });
        if self.collected.len() < expected {
            Step::Continue
        } else {
            Step::Complete(std::mem::take(&mut self.collected))
        }
    }
}
