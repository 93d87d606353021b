//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Collector credentials may also come from the environment
//! (`INFLUXDB_URL`, `INFLUXDB_ORG`, `INFLUXDB_BUCKET`, `INFLUXDB_TOKEN`),
//! which takes precedence over the file.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, UplinkError};
use crate::measurement::{MeasurementSetting, KNOWN_GAIN_TAGS, POSITION_FIELD_KEYS};

/// Number of single-ended inputs on the ADC front end
pub const MAX_CHANNELS: usize = 4;

/// Largest batch the collector accepts in one request
pub const MAX_BATCH_LIMIT: usize = 5000;

/// Fewest points a linear fit is computed from
pub const MIN_CALIBRATION_POINTS: usize = 3;

/// Most points one calibration run may collect
pub const MAX_CALIBRATION_POINTS: usize = 1024;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub collector: CollectorConfig,
    pub timing: TimingConfig,
    pub queue: QueueConfig,
    pub record: RecordConfig,
    pub calibration: CalibrationConfig,
    pub logging: LoggingConfig,

    #[serde(default)]
    pub channels: Vec<MeasurementSetting>,
}

/// Remote time-series collector
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    #[serde(default = "default_collector_url")]
    pub url: String,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub token: String,
}

/// Loop cadences and request timeouts
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,

    #[serde(default = "default_queue_interval_s")]
    pub queue_interval_s: u64,

    #[serde(default = "default_send_connect_timeout_ms")]
    pub send_connect_timeout_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_batch_connect_timeout_ms")]
    pub batch_connect_timeout_ms: u64,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
}

/// Offline queue storage
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_dir")]
    pub dir: String,

    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

/// Measurement name and tags of published records
#[derive(Debug, Deserialize, Clone)]
pub struct RecordConfig {
    #[serde(default = "default_measurement")]
    pub measurement: String,

    #[serde(default = "default_source")]
    pub source: String,
}

/// Operator calibration protocol
#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    #[serde(default = "default_calibration_enabled")]
    pub enabled: bool,

    #[serde(default = "default_report_dir")]
    pub report_dir: String,

    #[serde(default = "default_min_points")]
    pub min_points: usize,
}

/// Log output
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rolling log files; stdout only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

// Default value functions
fn default_collector_url() -> String { "http://localhost:8086".to_string() }

fn default_sample_interval_ms() -> u64 { 100 }
fn default_publish_interval_ms() -> u64 { 500 }
fn default_queue_interval_s() -> u64 { 60 }
fn default_send_connect_timeout_ms() -> u64 { 2000 }
fn default_send_timeout_ms() -> u64 { 5000 }
fn default_batch_connect_timeout_ms() -> u64 { 10000 }
fn default_batch_timeout_ms() -> u64 { 30000 }
fn default_shutdown_poll_ms() -> u64 { 100 }

fn default_queue_dir() -> String { "logs".to_string() }
fn default_max_batch() -> usize { MAX_BATCH_LIMIT }

fn default_measurement() -> String { "measurements".to_string() }
fn default_source() -> String { "instrumentation".to_string() }

fn default_calibration_enabled() -> bool { true }
fn default_report_dir() -> String { "calibration".to_string() }
fn default_min_points() -> usize { MIN_CALIBRATION_POINTS }

fn default_log_level() -> String { "info".to_string() }

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            url: default_collector_url(),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            publish_interval_ms: default_publish_interval_ms(),
            queue_interval_s: default_queue_interval_s(),
            send_connect_timeout_ms: default_send_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            batch_connect_timeout_ms: default_batch_connect_timeout_ms(),
            batch_timeout_ms: default_batch_timeout_ms(),
            shutdown_poll_ms: default_shutdown_poll_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: default_queue_dir(),
            max_batch: default_max_batch(),
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            measurement: default_measurement(),
            source: default_source(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: default_calibration_enabled(),
            report_dir: default_report_dir(),
            min_points: default_min_points(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl TimingConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue_interval_s)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }
}

fn invalid(message: impl std::fmt::Display) -> UplinkError {
    UplinkError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// Channel entries are not checked here; see [`Config::sanitize_channels`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_uplink::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Replace collector settings with values from `lookup`
    ///
    /// `lookup` maps an environment variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets = [
            ("INFLUXDB_URL", &mut self.collector.url),
            ("INFLUXDB_ORG", &mut self.collector.org),
            ("INFLUXDB_BUCKET", &mut self.collector.bucket),
            ("INFLUXDB_TOKEN", &mut self.collector.token),
        ];
        for (key, target) in targets {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = value;
            }
        }
    }

    /// Deactivate malformed channels instead of failing
    ///
    /// A channel is forced to the inactive sentinel when its gain tag is
    /// unknown, its coefficients are not finite, its id cannot appear in a
    /// record, or its id repeats an earlier channel or a position key.
    /// Channels past [`MAX_CHANNELS`] are dropped. Returns the number of
    /// channels that were changed or dropped.
    pub fn sanitize_channels(&mut self) -> usize {
        let mut changed = 0;

        if self.channels.len() > MAX_CHANNELS {
            warn!(
                "{} channels configured, only the first {} are sampled",
                self.channels.len(),
                MAX_CHANNELS
            );
            changed += self.channels.len() - MAX_CHANNELS;
            self.channels.truncate(MAX_CHANNELS);
        }

        let mut seen: Vec<String> = Vec::new();
        for (index, channel) in self.channels.iter_mut().enumerate() {
            if !channel.is_active() {
                continue;
            }

            let problem = if !KNOWN_GAIN_TAGS.contains(&channel.gain_tag.as_str()) {
                Some(format!("unknown gain tag {:?}", channel.gain_tag))
            } else if !channel.slope.is_finite() || !channel.offset.is_finite() {
                Some("slope and offset must be finite".to_string())
            } else if channel.id.contains([' ', ',', '=', '"', '\\', '\n', '\r']) {
                Some(format!("id {:?} contains a reserved character", channel.id))
            } else if seen.contains(&channel.id) || POSITION_FIELD_KEYS.contains(&channel.id.as_str()) {
                Some(format!("id {:?} is already in use", channel.id))
            } else {
                None
            };

            match problem {
                Some(reason) => {
                    warn!("Channel {} ({}) disabled: {}", index, channel.id, reason);
                    *channel = MeasurementSetting::inactive();
                    changed += 1;
                }
                None => seen.push(channel.id.clone()),
            }
        }

        changed
    }

    /// Validate configuration values
    ///
    /// # Returns
    ///
    /// * `Result<()>` - Ok if valid, Err if invalid
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Validate collector configuration
        if self.collector.url.is_empty() {
            return Err(invalid("collector url cannot be empty"));
        }

        if !self.collector.url.starts_with("http://") && !self.collector.url.starts_with("https://") {
            return Err(invalid("collector url must start with http:// or https://"));
        }

        if self.collector.org.is_empty() {
            return Err(invalid("collector org cannot be empty"));
        }

        if self.collector.bucket.is_empty() {
            return Err(invalid("collector bucket cannot be empty"));
        }

        // Validate timing fields
        if self.timing.sample_interval_ms == 0 || self.timing.sample_interval_ms > 60000 {
            return Err(invalid("sample_interval_ms must be between 1 and 60000"));
        }

        if self.timing.publish_interval_ms < self.timing.sample_interval_ms
            || self.timing.publish_interval_ms > 3_600_000 {
            return Err(invalid("publish_interval_ms must be between sample_interval_ms and 3600000"));
        }

        if self.timing.queue_interval_s == 0 || self.timing.queue_interval_s > 86400 {
            return Err(invalid("queue_interval_s must be between 1 and 86400"));
        }

        for (name, value) in [
            ("send_connect_timeout_ms", self.timing.send_connect_timeout_ms),
            ("send_timeout_ms", self.timing.send_timeout_ms),
            ("batch_connect_timeout_ms", self.timing.batch_connect_timeout_ms),
            ("batch_timeout_ms", self.timing.batch_timeout_ms),
        ] {
            if value == 0 || value > 300000 {
                return Err(invalid(format!("{} must be between 1 and 300000", name)));
            }
        }

        if self.timing.send_connect_timeout_ms > self.timing.send_timeout_ms {
            return Err(invalid("send_connect_timeout_ms cannot exceed send_timeout_ms"));
        }

        if self.timing.batch_connect_timeout_ms > self.timing.batch_timeout_ms {
            return Err(invalid("batch_connect_timeout_ms cannot exceed batch_timeout_ms"));
        }

        if self.timing.shutdown_poll_ms == 0 || self.timing.shutdown_poll_ms > 5000 {
            return Err(invalid("shutdown_poll_ms must be between 1 and 5000"));
        }

        // Validate queue configuration
        if self.queue.dir.is_empty() {
            return Err(invalid("queue dir cannot be empty"));
        }

        if self.queue.max_batch == 0 || self.queue.max_batch > MAX_BATCH_LIMIT {
            return Err(invalid(format!("max_batch must be between 1 and {}", MAX_BATCH_LIMIT)));
        }

        // Validate record layout
        for (name, value) in [
            ("record measurement", &self.record.measurement),
            ("record source", &self.record.source),
        ] {
            if value.is_empty() || value.contains([' ', ',', '=', '"', '\\', '\n', '\r']) {
                return Err(invalid(format!("{} must be non-empty and free of separators", name)));
            }
        }

        // Validate calibration
        if self.calibration.min_points < MIN_CALIBRATION_POINTS
            || self.calibration.min_points > MAX_CALIBRATION_POINTS {
            return Err(invalid(format!(
                "min_points must be between {} and {}",
                MIN_CALIBRATION_POINTS, MAX_CALIBRATION_POINTS
            )));
        }

        if self.calibration.enabled && self.calibration.report_dir.is_empty() {
            return Err(invalid("calibration report_dir cannot be empty when enabled"));
        }

        // Validate log level
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, gain: &str) -> MeasurementSetting {
        MeasurementSetting {
            id: id.to_string(),
            unit: "A".to_string(),
            slope: 0.004,
            offset: -37.2,
            gain_tag: gain.to_string(),
        }
    }

    fn create_valid_config() -> Config {
        Config {
            collector: CollectorConfig {
                url: default_collector_url(),
                org: "lab".to_string(),
                bucket: "boat".to_string(),
                token: "secret".to_string(),
            },
            timing: TimingConfig::default(),
            queue: QueueConfig::default(),
            record: RecordConfig::default(),
            calibration: CalibrationConfig::default(),
            logging: LoggingConfig::default(),
            channels: vec![channel("tensao", "1.024V"), channel("NC", "1.024V")],
        }
    }

    #[test]
    fn test_default_config() {
        assert!(create_valid_config().validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[collector]
url = "http://10.0.0.5:8086"
org = "lab"
bucket = "boat"

[timing]

[queue]

[record]

[calibration]

[logging]

[[channels]]
id = "tensao"
unit = "V"
slope = 0.000915
offset = 0.207378
gain = "4.096V"

[[channels]]
id = "NC"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].gain_tag, "4.096V");
        assert_eq!(config.channels[0].slope, 0.000915);
        assert!(!config.channels[1].is_active());
        assert_eq!(config.queue.max_batch, 5000);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/telemetry-uplink.toml");
        assert!(matches!(result, Err(UplinkError::Io(_))));
    }

    #[test]
    fn test_load_malformed_toml() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[collector\norg = ").unwrap();
        temp_file.flush().unwrap();

        assert!(matches!(Config::load(temp_file.path()), Err(UplinkError::Config(_))));
    }

    #[test]
    fn test_env_overrides_replace_collector_settings() {
        let mut config = create_valid_config();
        config.apply_overrides(|key| match key {
            "INFLUXDB_TOKEN" => Some("from-env".to_string()),
            "INFLUXDB_BUCKET" => Some(String::new()),
            _ => None,
        });

        assert_eq!(config.collector.token, "from-env");
        // Empty values do not clobber the file
        assert_eq!(config.collector.bucket, "boat");
        assert_eq!(config.collector.org, "lab");
    }

    #[test]
    fn test_empty_org() {
        let mut config = create_valid_config();
        config.collector.org = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_bucket() {
        let mut config = create_valid_config();
        config.collector.bucket = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_url_scheme_required() {
        let mut config = create_valid_config();
        config.collector.url = "10.0.0.5:8086".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_interval_zero() {
        let mut config = create_valid_config();
        config.timing.sample_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_publish_faster_than_sampling() {
        let mut config = create_valid_config();
        config.timing.sample_interval_ms = 200;
        config.timing.publish_interval_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_interval_zero() {
        let mut config = create_valid_config();
        config.timing.queue_interval_s = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_zero() {
        let mut config = create_valid_config();
        config.timing.batch_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connect_timeout_above_total() {
        let mut config = create_valid_config();
        config.timing.send_connect_timeout_ms = 6000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_batch_bounds() {
        let mut config = create_valid_config();
        config.queue.max_batch = 0;
        assert!(config.validate().is_err());

        config.queue.max_batch = MAX_BATCH_LIMIT + 1;
        assert!(config.validate().is_err());

        config.queue.max_batch = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_queue_dir() {
        let mut config = create_valid_config();
        config.queue.dir = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_record_source_with_separator() {
        let mut config = create_valid_config();
        config.record.source = "on board".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_points_below_three() {
        let mut config = create_valid_config();
        config.calibration.min_points = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_report_dir_when_disabled() {
        let mut config = create_valid_config();
        config.calibration.enabled = false;
        config.calibration.report_dir = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = create_valid_config();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sanitize_unknown_gain_disables_channel() {
        let mut config = create_valid_config();
        config.channels = vec![channel("tensao", "3.3V"), channel("corrente", "2.048V")];

        assert_eq!(config.sanitize_channels(), 1);
        assert!(!config.channels[0].is_active());
        assert_eq!(config.channels[1].id, "corrente");
    }

    #[test]
    fn test_sanitize_non_finite_coefficients() {
        let mut config = create_valid_config();
        config.channels[0].slope = f64::NAN;

        assert_eq!(config.sanitize_channels(), 1);
        assert!(!config.channels[0].is_active());
    }

    #[test]
    fn test_sanitize_duplicate_and_reserved_ids() {
        let mut config = create_valid_config();
        config.channels = vec![
            channel("tensao", "1.024V"),
            channel("tensao", "1.024V"),
            channel("latitude", "1.024V"),
            channel("a,b", "1.024V"),
        ];

        assert_eq!(config.sanitize_channels(), 3);
        assert!(config.channels[0].is_active());
        assert!(config.channels[1..].iter().all(|c| !c.is_active()));
    }

    #[test]
    fn test_sanitize_truncates_extra_channels() {
        let mut config = create_valid_config();
        config.channels = (0..6).map(|i| channel(&format!("ch{}", i), "1.024V")).collect();

        assert_eq!(config.sanitize_channels(), 2);
        assert_eq!(config.channels.len(), MAX_CHANNELS);
    }

    #[test]
    fn test_duration_helpers() {
        let timing = TimingConfig::default();
        assert_eq!(timing.sample_interval(), Duration::from_millis(100));
        assert_eq!(timing.publish_interval(), Duration::from_millis(500));
        assert_eq!(timing.queue_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_collector_url(), "http://localhost:8086");
        assert_eq!(default_send_connect_timeout_ms(), 2000);
        assert_eq!(default_send_timeout_ms(), 5000);
        assert_eq!(default_batch_connect_timeout_ms(), 10000);
        assert_eq!(default_batch_timeout_ms(), 30000);
        assert_eq!(default_queue_dir(), "logs");
        assert_eq!(default_max_batch(), 5000);
        assert_eq!(default_measurement(), "measurements");
        assert_eq!(default_min_points(), 3);
        assert_eq!(default_log_level(), "info");
    }
}
