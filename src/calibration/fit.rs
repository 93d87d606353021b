//! # Least-Squares Fit
//!
//! Derives a channel's correction from operator-supplied points.
//!
//! For `n` points `(x, y)` with `x` the raw count and `y` the measured
//! physical value:
//!
//! ```text
//! slope  = (n·Σxy − Σx·Σy) / (n·Σx² − (Σx)²)
//! offset = (Σy − slope·Σx) / n
//! ```
//!
//! ## Usage
//!
//! ```
//! use telemetry_uplink::calibration::fit::{least_squares, CalibrationPoint};
//!
//! let points = [
//!     CalibrationPoint { raw: 100, actual: 0.0 },
//!     CalibrationPoint { raw: 500, actual: 12.0 },
//!     CalibrationPoint { raw: 900, actual: 24.0 },
//! ];
//! let correction = least_squares(&points).unwrap();
//! assert!((correction.slope - 0.03).abs() < 1e-12);
//! assert!((correction.offset + 3.0).abs() < 1e-9);
//! ```

use serde::Serialize;

use crate::config::MIN_CALIBRATION_POINTS;
use crate::error::{Result, UplinkError};
use crate::measurement::Correction;

/// One raw sample paired with its ground-truth value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationPoint {
    pub raw: i32,
    pub actual: f64,
}

/// Fit `actual = slope * raw + offset` over `points`
///
/// # Errors
///
/// Returns [`UplinkError::Calibration`] if there are fewer than
/// [`MIN_CALIBRATION_POINTS`] points, if every raw value is the same, or if
/// the result is not finite.
pub fn least_squares(points: &[CalibrationPoint]) -> Result<Correction> {
    if points.len() < MIN_CALIBRATION_POINTS {
        return Err(UplinkError::Calibration(format!(
            "need at least {} points, got {}",
            MIN_CALIBRATION_POINTS,
            points.len()
        )));
    }

    let n = points.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for point in points {
        let x = f64::from(point.raw);
        sum_x += x;
        sum_y += point.actual;
        sum_xy += x * point.actual;
        sum_x2 += x * x;
    }

    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return Err(UplinkError::Calibration(
            "raw values do not vary; cannot fit a line".to_string(),
        ));
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let offset = (sum_y - slope * sum_x) / n;
    if !slope.is_finite() || !offset.is_finite() {
        return Err(UplinkError::Calibration("fit is not finite".to_string()));
    }

    Ok(Correction { slope, offset })
}
