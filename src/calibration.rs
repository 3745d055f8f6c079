//! Resting-baseline calibration.
//!
//! The armband adjusts its own sensitivity; the host only observes frames and
//! asks for one more `Increment` until enough channels read above the threshold.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{CalibrationSettings, DeviceConfig, SerialSettings};
use crate::errors::{DriverError, Result};
use crate::protocol::Frame;
use crate::session::{DeviceSession, PortHandle, PortOpener};

/// Outcome of one calibration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// First frame with enough maxed channels.
    pub raw_frame: Frame,
    /// Increment steps the device needed.
    pub iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibrator {
    pub threshold: u8,
    pub num_to_max: usize,
    pub max_iterations: u32,
}

impl Default for Calibrator {
    fn default() -> Self {
        CalibrationSettings::default().into()
    }
}

impl From<CalibrationSettings> for Calibrator {
    fn from(s: CalibrationSettings) -> Self {
        Self {
            threshold: s.threshold,
            num_to_max: s.num_to_max,
            max_iterations: s.max_iterations,
        }
    }
}

impl Calibrator {
    pub fn new(threshold: u8, num_to_max: usize) -> Self {
        Self {
            threshold,
            num_to_max,
            ..Default::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Drive `session` until `num_to_max` channels exceed `threshold`.
    ///
    /// Errors abort immediately; the device state after a partial command is
    /// unknown, so nothing is retried.
    pub fn run(&self, session: &mut DeviceSession) -> Result<CalibrationResult> {
        session.reset()?;
        loop {
            let frame = session.sample()?;
            let maxed = frame.count_above(self.threshold);
            let iterations = session.calibration_iterations();
            debug!(
                "calibration step: device={}, iteration={}, maxed={}, frame={:?}",
                session.name(),
                iterations,
                maxed,
                frame.as_slice()
            );

            if maxed >= self.num_to_max {
                info!(
                    "calibration done: device={}, iterations={}",
                    session.name(),
                    iterations
                );
                return Ok(CalibrationResult {
                    raw_frame: frame,
                    iterations,
                });
            }

            if iterations >= self.max_iterations {
                warn!(
                    "calibration gave up: device={}, iterations={}, last frame={:?}",
                    session.name(),
                    iterations,
                    frame.as_slice()
                );
                return Err(DriverError::CalibrationTimeout { iterations });
            }

            session.increment()?;
        }
    }
}

/// Open `port`, calibrate it, and close it again regardless of outcome.
pub fn calibrate_device(
    opener: &dyn PortOpener,
    device: &DeviceConfig,
    port: &PortHandle,
    serial: &SerialSettings,
    calibrator: &Calibrator,
) -> Result<CalibrationResult> {
    let layout = device.layout()?;
    let mut session = DeviceSession::open(opener, &device.name, port, layout, serial)?;
    let result = calibrator.run(&mut session);
    session.close();
    result
}

/// Reset calibration on every session, stopping at the first failure.
pub fn reset_all<'a>(sessions: impl IntoIterator<Item = &'a mut DeviceSession>) -> Result<()> {
    for session in sessions {
        session.reset()?;
        session.flush()?;
        info!("calibration reset: device={}", session.name());
    }
    Ok(())
}
