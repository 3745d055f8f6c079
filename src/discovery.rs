//! Find configured armbands among the host's serial ports.

use log::{debug, info, warn};
use serialport::SerialPortType;

use crate::config::{DeviceConfig, Registry, SerialSettings};
use crate::errors::DiscoveryError;
use crate::protocol::FrameLayout;
use crate::session::{DeviceSession, PortHandle, PortOpener};

/// Every serial port the OS reports, with USB serial numbers where available.
pub fn enumerate_candidate_ports() -> Result<Vec<PortHandle>, DiscoveryError> {
    let ports = serialport::available_ports()?;
    debug!("enumerated {} serial port(s)", ports.len());
    Ok(ports
        .into_iter()
        .map(|p| {
            let serial_number = match p.port_type {
                SerialPortType::UsbPort(info) => info.serial_number,
                _ => None,
            };
            PortHandle {
                port_name: p.port_name,
                serial_number,
            }
        })
        .collect())
}

/// Whether `port` answers the connect handshake. The port is always released.
pub fn probe(opener: &dyn PortOpener, port: &PortHandle, settings: &SerialSettings) -> bool {
    let transport = match opener.open(port, settings) {
        Ok(t) => t,
        Err(e) => {
            debug!("probe could not open {}: {}", port.port_name, e);
            return false;
        }
    };

    let mut session = DeviceSession::attach(
        "probe",
        &port.port_name,
        transport,
        FrameLayout::full(),
        settings.response_timeout(),
    );
    match session.connect() {
        Ok(()) => {
            debug!("probe ok: port={}", port.port_name);
            session.close();
            true
        }
        Err(e) => {
            debug!("probe failed: port={}, error={}", port.port_name, e);
            session.release();
            false
        }
    }
}

/// Result of pairing discovered ports with the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Configured devices with a responding port, in registry order.
    pub matched: Vec<(DeviceConfig, PortHandle)>,
    /// Configured devices with no port.
    pub missing: Vec<DeviceConfig>,
}

impl DiscoveryReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn missing_names(&self) -> Vec<String> {
        self.missing.iter().map(|d| d.name.clone()).collect()
    }

    pub fn port_for(&self, name: &str) -> Option<&PortHandle> {
        self.matched
            .iter()
            .find(|(d, _)| d.name == name)
            .map(|(_, p)| p)
    }

    /// All configured devices, or `Mismatch` naming the absent ones.
    pub fn require_all(self) -> Result<Vec<(DeviceConfig, PortHandle)>, DiscoveryError> {
        if !self.is_complete() {
            return Err(DiscoveryError::Mismatch {
                missing: self.missing_names(),
            });
        }
        Ok(self.matched)
    }

    /// The single device called `name`.
    pub fn select(self, name: &str) -> Result<(DeviceConfig, PortHandle), DiscoveryError> {
        if let Some(found) = self.matched.into_iter().find(|(d, _)| d.name == name) {
            return Ok(found);
        }
        if self.missing.iter().any(|d| d.name == name) {
            return Err(DiscoveryError::Mismatch {
                missing: vec![name.to_string()],
            });
        }
        Err(DiscoveryError::UnknownDevice(name.to_string()))
    }
}

/// Pair ports with registry entries by serial number. Unknown ports are ignored.
pub fn match_registry(ports: &[PortHandle], registry: &Registry) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    for device in &registry.devices {
        let port = ports.iter().find(|p| {
            p.serial_number
                .as_deref()
                .is_some_and(|sn| sn.eq_ignore_ascii_case(&device.serial_number))
        });
        match port {
            Some(port) => {
                info!(
                    "device found: device={}, port={}",
                    device.name, port.port_name
                );
                report.matched.push((device.clone(), port.clone()));
            }
            None => {
                warn!(
                    "device missing: device={}, serial={}",
                    device.name, device.serial_number
                );
                report.missing.push(device.clone());
            }
        }
    }
    report
}

/// Probe `ports` and match the responders against the registry.
pub fn discover_from(
    opener: &dyn PortOpener,
    ports: &[PortHandle],
    registry: &Registry,
) -> DiscoveryReport {
    let responding: Vec<PortHandle> = ports
        .iter()
        .filter(|p| probe(opener, p, &registry.serial))
        .cloned()
        .collect();
    match_registry(&responding, registry)
}

/// Enumerate, probe and match in one go.
pub fn discover(
    opener: &dyn PortOpener,
    registry: &Registry,
) -> Result<DiscoveryReport, DiscoveryError> {
    let ports = enumerate_candidate_ports()?;
    Ok(discover_from(opener, &ports, registry))
}
