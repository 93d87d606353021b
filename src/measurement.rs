//! # Measurement Model
//!
//! Per-channel settings, live measurements and the optional position fix.
//!
//! A channel turns a raw ADC count into a physical value with a linear
//! correction: `value = raw * slope + offset`. The correction starts from the
//! configured coefficients and may later be replaced by the calibration
//! protocol.

use serde::{Deserialize, Serialize};

/// Channel id marking an unconnected (inactive) channel
pub const INACTIVE_CHANNEL_ID: &str = "NC";

/// Front-end full-scale ranges accepted as gain tags
pub const KNOWN_GAIN_TAGS: &[&str] = &["6.144V", "4.096V", "2.048V", "1.024V", "0.512V", "0.256V"];

/// Static configuration of one ADC channel, loaded once at startup
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MeasurementSetting {
    /// Field key used in published records, or `NC`
    #[serde(default = "default_id")]
    pub id: String,

    #[serde(default)]
    pub unit: String,

    #[serde(default = "default_slope")]
    pub slope: f64,

    #[serde(default)]
    pub offset: f64,

    /// Full-scale range label of the analog front end
    #[serde(default = "default_gain", rename = "gain")]
    pub gain_tag: String,
}

fn default_id() -> String { INACTIVE_CHANNEL_ID.to_string() }
fn default_slope() -> f64 { 1.0 }
fn default_gain() -> String { "1.024V".to_string() }

impl MeasurementSetting {
    /// An unconnected channel
    #[must_use]
    pub fn inactive() -> Self {
        Self {
            id: default_id(),
            unit: String::new(),
            slope: default_slope(),
            offset: 0.0,
            gain_tag: default_gain(),
        }
    }

    /// Whether this channel contributes a field to published records
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.id.is_empty() && self.id != INACTIVE_CHANNEL_ID
    }

    /// Initial correction taken from the configured coefficients
    #[must_use]
    pub fn correction(&self) -> Correction {
        Correction {
            slope: self.slope,
            offset: self.offset,
        }
    }
}

/// Linear correction coefficients mapping a raw count to a physical value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Correction {
    pub slope: f64,
    pub offset: f64,
}

impl Default for Correction {
    fn default() -> Self {
        Self {
            slope: 1.0,
            offset: 0.0,
        }
    }
}

impl Correction {
    /// Apply the correction to a raw sample
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetry_uplink::measurement::Correction;
    ///
    /// let correction = Correction { slope: 0.03, offset: -3.0 };
    /// assert!((correction.apply(500) - 12.0).abs() < 1e-9);
    /// ```
    #[must_use]
    pub fn apply(&self, raw: i32) -> f64 {
        f64::from(raw) * self.slope + self.offset
    }
}

/// Live state of one channel
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    /// Last raw sample from the ADC
    pub raw_value: i32,
    pub correction: Correction,
}

impl Measurement {
    /// Fresh measurement seeded with the setting's coefficients
    #[must_use]
    pub fn from_setting(setting: &MeasurementSetting) -> Self {
        Self {
            raw_value: 0,
            correction: setting.correction(),
        }
    }

    /// Physical value of the last sample
    #[must_use]
    pub fn value(&self) -> f64 {
        self.correction.apply(self.raw_value)
    }
}

/// Position and velocity fix from the location client
///
/// Each component is optional; only set components are published.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
}

/// Field keys used for position components, in emission order
pub const POSITION_FIELD_KEYS: [&str; 4] = ["latitude", "longitude", "altitude", "speed"];

impl PositionFix {
    /// Build a fix from raw readings where NaN means "unset"
    #[must_use]
    pub fn from_raw(latitude: f64, longitude: f64, altitude: f64, speed: f64) -> Self {
        let set = |v: f64| if v.is_nan() { None } else { Some(v) };
        Self {
            latitude: set(latitude),
            longitude: set(longitude),
            altitude: set(altitude),
            speed: set(speed),
        }
    }

    /// Set components as `(field key, value)` pairs, in emission order
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, f64)> {
        let values = [self.latitude, self.longitude, self.altitude, self.speed];
        POSITION_FIELD_KEYS
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
    }
}
