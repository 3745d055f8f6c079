use std::io;
use thiserror::Error;

/// Errors raised while decoding a raw device buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("short frame buffer: expected {expected} bytes, got {actual}")]
    Short { expected: usize, actual: usize },
    #[error("oversized frame buffer: expected {expected} bytes, got {actual}")]
    Long { expected: usize, actual: usize },
    #[error("unsupported channel count {0} (must be 1-8)")]
    ChannelCount(usize),
    #[error("absent channel slot {0} out of range (must be 0-7)")]
    AbsentChannel(usize),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("handshake failed on {port}: no 'A' in response {response:02X?}")]
    Connect { port: String, response: Vec<u8> },
    #[error("flush failed: device still sent {stray} byte(s) after quiesce")]
    Flush { stray: usize },
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("device disconnected: {0}")]
    Disconnected(io::Error),
    #[error("calibration did not converge after {iterations} iterations")]
    CalibrationTimeout { iterations: u32 },
    #[error("session is not connected")]
    NotConnected,
}

impl DriverError {
    /// Classify an I/O failure from a live link. Timeouts are not disconnects.
    pub(crate) fn from_link(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DriverError::Io(err),
            _ => DriverError::Disconnected(err),
        }
    }

    /// Whether the failure means the hardware could not be reached at all.
    pub fn class(&self) -> ErrorClass {
        match self {
            DriverError::Serial(e) if e.kind() == serialport::ErrorKind::NoDevice => {
                ErrorClass::NotFound
            }
            DriverError::Connect { .. } => ErrorClass::NotFound,
            _ => ErrorClass::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("configured device(s) not found: {}", missing.join(", "))]
    Mismatch { missing: Vec<String> },
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("port enumeration failed: {0}")]
    Enumerate(#[from] serialport::Error),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("device {device} failed: {source}")]
    Device {
        device: String,
        #[source]
        source: DriverError,
    },
    #[error("no devices to acquire from")]
    NoDevices,
    #[error("invalid acquisition request: {0}")]
    InvalidSettings(String),
    #[error("sample sink failed: {0}")]
    Sink(io::Error),
    #[error("worker pool error: {0}")]
    Runtime(String),
}

impl AcquisitionError {
    pub(crate) fn device(device: &str, source: DriverError) -> Self {
        AcquisitionError::Device {
            device: device.to_string(),
            source,
        }
    }

    /// Name of the device that aborted the session, if any.
    pub fn failed_device(&self) -> Option<&str> {
        match self {
            AcquisitionError::Device { device, .. } => Some(device),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AcquisitionError::Device { source, .. } => source.class(),
            AcquisitionError::NoDevices => ErrorClass::NotFound,
            AcquisitionError::InvalidSettings(_)
            | AcquisitionError::Sink(_)
            | AcquisitionError::Runtime(_) => ErrorClass::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read registry {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid registry document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid registry: {0}")]
    Invalid(String),
}

/// Coarse outcome class handed to the web layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Hardware missing or not answering; fixable by reconnecting it.
    NotFound,
    /// Device failed mid-operation; the session was aborted.
    Failed,
}

impl ErrorClass {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorClass::NotFound => 400,
            ErrorClass::Failed => 500,
        }
    }
}

impl DiscoveryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DiscoveryError::Mismatch { .. } | DiscoveryError::UnknownDevice(_) => {
                ErrorClass::NotFound
            }
            DiscoveryError::Enumerate(_) => ErrorClass::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
