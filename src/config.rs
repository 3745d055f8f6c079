//! Device registry and runtime settings.
//!
//! The registry is an explicit value handed to discovery and the scheduler, loaded
//! once from a JSON document:
//!
//! ```json
//! {
//!   "devices": [
//!     { "name": "forearm", "serial_number": "5573631303835151F0E1", "channel_count": 8 },
//!     { "name": "wrist", "serial_number": "55736313038351A0A1C2", "channel_count": 7, "absent_channel": 1 }
//!   ],
//!   "serial": { "baud_rate": 250000, "response_timeout_ms": 10 },
//!   "calibration": { "threshold": 117, "num_to_max": 2, "max_iterations": 255 },
//!   "acquisition": { "duration_ms": 5000, "tick_interval_ms": 20 }
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, FrameError};
use crate::protocol::{FrameLayout, DEFAULT_ABSENT_CHANNEL, MAX_CHANNELS};

/// Default serial baud rate for BIOX armbands
pub const BAUD_RATE: u32 = 250_000;

/// Settle delay after each command, also the bound on every read
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(10);

/// Readings above this value count as a maxed sensor during calibration
pub const CALIBRATION_THRESHOLD: u8 = 117;

/// Maxed sensors required before calibration stops
pub const CALIBRATION_NUM_TO_MAX: usize = 2;

/// Increment steps allowed before calibration gives up
pub const CALIBRATION_MAX_ITERATIONS: u32 = 255;

/// Default observation window of one acquisition session
pub const ACQUISITION_DURATION: Duration = Duration::from_secs(5);

/// Default target tick period (50 Hz)
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// One configured armband.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub serial_number: String,
    pub channel_count: usize,
    /// Logical slot without a sensor; only used when `channel_count < 8`.
    #[serde(default = "default_absent_channel")]
    pub absent_channel: usize,
}

fn default_absent_channel() -> usize {
    DEFAULT_ABSENT_CHANNEL
}

impl DeviceConfig {
    pub fn new(name: &str, serial_number: &str, channel_count: usize) -> Self {
        Self {
            name: name.to_string(),
            serial_number: serial_number.to_string(),
            channel_count,
            absent_channel: DEFAULT_ABSENT_CHANNEL,
        }
    }

    pub fn with_absent_channel(mut self, absent_channel: usize) -> Self {
        self.absent_channel = absent_channel;
        self
    }

    pub fn layout(&self) -> Result<FrameLayout, FrameError> {
        FrameLayout::new(self.channel_count, self.absent_channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            response_timeout_ms: RESPONSE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl SerialSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub threshold: u8,
    pub num_to_max: usize,
    pub max_iterations: u32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            threshold: CALIBRATION_THRESHOLD,
            num_to_max: CALIBRATION_NUM_TO_MAX,
            max_iterations: CALIBRATION_MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub duration_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            duration_ms: ACQUISITION_DURATION.as_millis() as u64,
            tick_interval_ms: TICK_INTERVAL.as_millis() as u64,
        }
    }
}

impl AcquisitionSettings {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// The full registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub calibration: CalibrationSettings,
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
}

impl Registry {
    pub fn from_devices(devices: Vec<DeviceConfig>) -> Self {
        Self {
            devices,
            ..Default::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let registry: Registry = serde_json::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut serials = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(ConfigError::Invalid("device with empty name".into()));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name {}",
                    device.name
                )));
            }
            if !serials.insert(device.serial_number.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate serial number {}",
                    device.serial_number
                )));
            }
            if device.channel_count == 0 || device.channel_count > MAX_CHANNELS {
                return Err(ConfigError::Invalid(format!(
                    "device {}: channel_count {} out of range 1-{MAX_CHANNELS}",
                    device.name, device.channel_count
                )));
            }
            device
                .layout()
                .map_err(|e| ConfigError::Invalid(format!("device {}: {e}", device.name)))?;
        }
        if self.acquisition.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be > 0".into()));
        }
        if self.calibration.num_to_max == 0 {
            return Err(ConfigError::Invalid("num_to_max must be > 0".into()));
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn by_serial(&self, serial_number: &str) -> Option<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.serial_number.eq_ignore_ascii_case(serial_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let registry = Registry::from_json(
            r#"{ "devices": [ { "name": "wrist", "serial_number": "A1", "channel_count": 7 } ] }"#,
        )
        .unwrap();
        assert_eq!(registry.serial, SerialSettings::default());
        assert_eq!(registry.calibration.threshold, 117);
        assert_eq!(registry.calibration.num_to_max, 2);
        assert_eq!(registry.acquisition.duration(), Duration::from_secs(5));
        assert_eq!(registry.devices[0].absent_channel, DEFAULT_ABSENT_CHANNEL);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let registry = Registry::from_json(
            r#"{ "devices": [], "serial": { "response_timeout_ms": 2 }, "acquisition": { "duration_ms": 100 } }"#,
        )
        .unwrap();
        assert_eq!(registry.serial.baud_rate, BAUD_RATE);
        assert_eq!(registry.serial.response_timeout(), Duration::from_millis(2));
        assert_eq!(registry.acquisition.tick_interval(), TICK_INTERVAL);
    }

    #[test]
    fn rejects_bad_channel_count_and_duplicates() {
        let too_many = r#"{ "devices": [ { "name": "a", "serial_number": "1", "channel_count": 9 } ] }"#;
        assert!(matches!(
            Registry::from_json(too_many),
            Err(ConfigError::Invalid(_))
        ));

        let dup = Registry::from_devices(vec![
            DeviceConfig::new("a", "1", 8),
            DeviceConfig::new("a", "2", 8),
        ]);
        assert!(dup.validate().is_err());

        let dup_serial = Registry::from_devices(vec![
            DeviceConfig::new("a", "1", 8),
            DeviceConfig::new("b", "1", 8),
        ]);
        assert!(dup_serial.validate().is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            Registry::from_json("{ devices: "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn lookup_by_name_and_serial() {
        let registry = Registry::from_devices(vec![
            DeviceConfig::new("forearm", "ABC123", 8),
            DeviceConfig::new("wrist", "DEF456", 7).with_absent_channel(1),
        ]);
        assert_eq!(registry.device("wrist").unwrap().absent_channel, 1);
        assert_eq!(registry.by_serial("abc123").unwrap().name, "forearm");
        assert!(registry.device("ankle").is_none());
    }
}
