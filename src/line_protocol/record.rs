//! # Record Builder
//!
//! Composes one telemetry record per publish tick from every active channel
//! and the set components of the position fix.

use super::encoder::{LineBuffer, MAX_TIMESTAMP_WIDTH, MAX_VALUE_WIDTH};
use crate::error::EncodeError;
use crate::measurement::{Measurement, MeasurementSetting, PositionFix, POSITION_FIELD_KEYS};

/// Name, tags and buffer size shared by every record of a run
///
/// The capacity is derived from the configured channel ids, tags and
/// position keys, so a record with every channel and every position
/// component active always fits unless a value is absurdly large.
#[derive(Debug, Clone)]
pub struct RecordTemplate {
    name: String,
    tags: Vec<(String, String)>,
    capacity: usize,
}

impl RecordTemplate {
    /// Create a template sized for `settings`
    #[must_use]
    pub fn new(name: &str, tags: Vec<(String, String)>, settings: &[MeasurementSetting]) -> Self {
        let field_keys = settings
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.id.as_str())
            .chain(POSITION_FIELD_KEYS);
        let capacity = record_capacity(name, &tags, field_keys);

        Self {
            name: name.to_string(),
            tags,
            capacity,
        }
    }

    /// Buffer capacity used for every record
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Encode one record
    ///
    /// Channels whose id is the inactive sentinel are skipped, as are unset
    /// position components. `settings` and `measurements` are paired by index.
    ///
    /// # Errors
    ///
    /// Returns the first [`EncodeError`] hit; a record is never partially
    /// returned. A record with no active channel and no position component
    /// fails with [`EncodeError::OutOfOrder`] since a record needs one field.
    pub fn build(
        &self,
        settings: &[MeasurementSetting],
        measurements: &[Measurement],
        fix: Option<&PositionFix>,
        timestamp: i64,
    ) -> Result<String, EncodeError> {
        let mut line = LineBuffer::with_capacity(self.capacity);
        line.set_name(&self.name)?;
        for (key, value) in &self.tags {
            line.add_tag(key, value)?;
        }

        for (setting, measurement) in settings.iter().zip(measurements) {
            if setting.is_active() {
                line.add_field(&setting.id, measurement.value())?;
            }
        }
        if let Some(fix) = fix {
            for (key, value) in fix.fields() {
                line.add_field(key, value)?;
            }
        }

        line.add_timestamp(timestamp)?;
        Ok(line.into_string())
    }
}

/// Worst-case encoded size for a record with the given keys
pub fn record_capacity<'a>(
    name: &str,
    tags: &[(String, String)],
    field_keys: impl IntoIterator<Item = &'a str>,
) -> usize {
    let tags: usize = tags.iter().map(|(k, v)| 2 + k.len() + v.len()).sum();
    let fields: usize = field_keys
        .into_iter()
        .map(|k| 2 + k.len() + MAX_VALUE_WIDTH)
        .sum();

    name.len() + tags + fields + 1 + MAX_TIMESTAMP_WIDTH
}
