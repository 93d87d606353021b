//! # Calibration Report
//!
//! JSON record of each installed correction, written to
//! `<report_dir>/channel_<n>.json`.

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::fit::CalibrationPoint;
use crate::error::Result;
use crate::measurement::Correction;

#[derive(Debug, Serialize)]
struct CalibrationReport<'a> {
    channel: usize,
    id: &'a str,
    calibrated_at: String,
    points: &'a [CalibrationPoint],
    slope: f64,
    offset: f64,
}

/// Write the report for `channel`, replacing any earlier one
///
/// # Errors
///
/// Returns an I/O error if the directory or file cannot be written.
pub fn write_report(
    dir: &Path,
    channel: usize,
    id: &str,
    points: &[CalibrationPoint],
    correction: Correction,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let report = CalibrationReport {
        channel,
        id,
        calibrated_at: Utc::now().to_rfc3339(),
        points,
        slope: correction.slope,
        offset: correction.offset,
    };
    let json = serde_json::to_string_pretty(&report).map_err(std::io::Error::from)?;

    let path = dir.join(format!("channel_{}.json", channel));
    fs::write(&path, json)?;
    Ok(path)
}
