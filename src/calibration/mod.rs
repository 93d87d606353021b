//! # Calibration Channel
//!
//! Operator-driven recalibration of one channel's correction.
//!
//! - [`listener`]: turns operator lines into requests and point values
//! - [`session`]: collects the requested number of points
//! - [`fit`]: least-squares line through the points
//! - [`report`]: JSON record of the installed correction

pub mod fit;
pub mod listener;
pub mod report;
pub mod session;

pub use fit::{least_squares, CalibrationPoint};
pub use listener::{run_listener, spawn_stdin_reader, OperatorInput};
pub use session::{CalibrationSession, Step};
