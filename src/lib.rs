//! BIOX armband driver and acquisition scheduler.
//!
//! This crate talks to BIOX force/EMG sensor armbands over USB serial, calibrates
//! each band's resting baseline, and samples several bands at a fixed rate.
//!
//! # Typical flow
//!
//! 1. Load a [`Registry`] (device name → serial number → channel count).
//! 2. [`discover`] the bands among the host's serial ports.
//! 3. [`calibrate_device`] each band once before a test.
//! 4. Run an [`AcquisitionScheduler`] and hand its [`Sample`]s to a [`SampleSink`].
//!
//! # Timing
//!
//! The band has no clock of its own. Every sample is stamped on the host with the
//! tick start, as both a monotonic offset from the session start and wall-clock
//! time. Ticks are scheduled at `start + k * interval`; a late tick does not shift
//! the ones after it, and slots it overran are skipped.

mod acquisition;
mod calibration;
mod config;
mod discovery;
mod errors;
pub mod logging;
mod protocol;
mod session;
mod sink;

#[cfg(test)]
mod mock;

#[cfg(feature = "python")]
mod python;

pub use acquisition::{AcquisitionScheduler, AcquisitionSummary, CancelToken, Sample};
pub use calibration::{calibrate_device, reset_all, CalibrationResult, Calibrator};
pub use config::{
    AcquisitionSettings, CalibrationSettings, DeviceConfig, Registry, SerialSettings,
};
pub use discovery::{
    discover, discover_from, enumerate_candidate_ports, match_registry, probe, DiscoveryReport,
};
pub use errors::*;
pub use protocol::{
    decode_frame, encode_command, Command, Frame, FrameLayout, BUFFER_WIDTH,
    DEFAULT_ABSENT_CHANNEL, MAX_CHANNELS,
};
pub use session::{DeviceSession, PortHandle, PortOpener, SerialOpener, Transport};
pub use sink::{JsonLinesSink, MemorySink, SampleSink};
