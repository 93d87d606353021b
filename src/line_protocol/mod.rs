//! # Line Protocol Module
//!
//! Text wire format for telemetry records.
//!
//! This module handles:
//! - Appending name, tags, fields and timestamp to a bounded buffer
//! - Six-decimal fixed rendering of numeric fields
//! - Composing one record from the channel table and the position fix

pub mod encoder;
pub mod record;

pub use encoder::LineBuffer;
pub use record::RecordTemplate;
