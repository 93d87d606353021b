//! # Sample Sources
//!
//! Seams to the acquisition hardware and the location client.
//!
//! The sampling loop only sees these traits, so tests drive it with
//! scripted readings and the binary can run without an ADC attached.

use crate::error::Result;
use crate::measurement::PositionFix;

/// Raw ADC readings, one channel at a time
pub trait SampleSource: Send {
    /// Read the current raw count of `channel`
    fn read_raw(&mut self, channel: usize) -> Result<i32>;
}

/// Latest position fix, if the location client has one
pub trait PositionSource: Send {
    fn latest_fix(&mut self) -> Option<PositionFix>;
}

/// Stand-in for the ADC: a slow triangle wave per channel
///
/// Channel `n` ramps between 0 and `amplitude`, phase-shifted by `n`
/// quarter periods.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    amplitude: i32,
    tick: u64,
}

impl SimulatedSource {
    #[must_use]
    pub fn new(amplitude: i32) -> Self {
        Self {
            amplitude: amplitude.max(1),
            tick: 0,
        }
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(2048)
    }
}

impl SampleSource for SimulatedSource {
    fn read_raw(&mut self, channel: usize) -> Result<i32> {
        let period = 2 * i64::from(self.amplitude);
        let quarter = i64::from(self.amplitude) / 2;
        let phase = (self.tick as i64 + channel as i64 * quarter) % period;
        if channel == 0 {
            self.tick = self.tick.wrapping_add(1);
        }

        let value = if phase < i64::from(self.amplitude) {
            phase
        } else {
            period - phase
        };
        Ok(value as i32)
    }
}

/// Location client that never has a fix
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPosition;

impl PositionSource for NoPosition {
    fn latest_fix(&mut self) -> Option<PositionFix> {
        None
    }
}
