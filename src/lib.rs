//! # Telemetry Uplink Library
//!
//! On-board telemetry pipeline for an intermittently connected sensor
//! platform.
//!
//! Calibrated channel readings are sampled, encoded as line protocol and
//! sent to a remote time-series collector. Records that cannot be
//! delivered are kept in a durable offline queue and retried later in
//! gzip-compressed batches. An operator can recalibrate any channel from
//! the console while the pipeline runs.

pub mod calibration;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod line_protocol;
pub mod measurement;
pub mod publisher;
pub mod queue;
pub mod shutdown;
pub mod sources;
pub mod state;
