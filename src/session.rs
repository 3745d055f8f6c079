//! One serial connection to one BIOX armband.
//!
//! The protocol is strictly request/response: every command is followed by a
//! host-side settle delay of `response_timeout`, after which the reply (if any) is
//! waiting in the OS buffer. Every read is bounded by the same timeout, so a
//! silent device yields a short response rather than a hang.
//!
//! All I/O methods take `&mut self`; a session moved into a worker task is the
//! only handle to its link, so two tasks can never interleave commands.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, SerialPort};

use crate::config::SerialSettings;
use crate::errors::{DriverError, Result};
use crate::protocol::{encode_command, Command, Frame, FrameLayout, BUFFER_WIDTH, HANDSHAKE_ACK};

/// Upper bound on bytes read for the connect reply.
const HANDSHAKE_MAX_LEN: usize = 16;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Byte link to a device, plus the two OS buffer controls the protocol needs.
pub trait Transport: Read + Write + Send {
    /// Discard anything pending in the OS input and output buffers.
    fn clear_buffers(&mut self) -> io::Result<()>;
    /// Bytes currently waiting in the OS input buffer.
    fn bytes_available(&mut self) -> io::Result<usize>;
}

impl Transport for Box<dyn SerialPort> {
    fn clear_buffers(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::All).map_err(io::Error::from)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        self.bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}

/// OS-level port identity as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortHandle {
    pub port_name: String,
    pub serial_number: Option<String>,
}

impl PortHandle {
    pub fn new(port_name: &str, serial_number: Option<&str>) -> Self {
        Self {
            port_name: port_name.to_string(),
            serial_number: serial_number.map(str::to_string),
        }
    }
}

/// Opens transports for ports. Discovery and the scheduler take one of these so
/// they can run against fakes.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &PortHandle, settings: &SerialSettings) -> Result<Box<dyn Transport>>;
}

/// Opens real serial ports (8 data bits, read/write timeout = response timeout).
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, port: &PortHandle, settings: &SerialSettings) -> Result<Box<dyn Transport>> {
        debug!(
            "opening serial port: port={}, baud={}",
            port.port_name, settings.baud_rate
        );
        let link = serialport::new(&port.port_name, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .timeout(settings.response_timeout())
            .open()?;
        Ok(Box::new(link))
    }
}

// ============================================================================
// Device Session
// ============================================================================

pub struct DeviceSession {
    name: String,
    port_name: String,
    transport: Option<Box<dyn Transport>>,
    layout: FrameLayout,
    response_timeout: Duration,
    calibration_iterations: u32,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("name", &self.name)
            .field("port_name", &self.port_name)
            .field("open", &self.is_open())
            .field("layout", &self.layout)
            .field("response_timeout", &self.response_timeout)
            .field("calibration_iterations", &self.calibration_iterations)
            .finish()
    }
}

impl DeviceSession {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Wrap an already-open transport. No handshake is performed.
    pub fn attach(
        name: &str,
        port_name: &str,
        transport: Box<dyn Transport>,
        layout: FrameLayout,
        response_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            port_name: port_name.to_string(),
            transport: Some(transport),
            layout,
            response_timeout,
            calibration_iterations: 0,
        }
    }

    /// Open `port` and perform the connect handshake.
    ///
    /// On a failed handshake the link is released before the error is returned.
    pub fn open(
        opener: &dyn PortOpener,
        name: &str,
        port: &PortHandle,
        layout: FrameLayout,
        settings: &SerialSettings,
    ) -> Result<Self> {
        let transport = opener.open(port, settings)?;
        let mut session = Self::attach(
            name,
            &port.port_name,
            transport,
            layout,
            settings.response_timeout(),
        );
        if let Err(e) = session.connect() {
            session.release();
            return Err(e);
        }
        info!(
            "device session open: device={}, port={}, channels={}",
            name,
            port.port_name,
            layout.channel_count()
        );
        Ok(session)
    }

    /// Send `Connect` and require the acknowledgement byte in the reply.
    ///
    /// The link stays open on failure; the caller must `close()` it.
    pub fn connect(&mut self) -> Result<()> {
        self.write(Command::Connect)?;
        let pending = self
            .transport_mut()?
            .bytes_available()
            .map_err(DriverError::from_link)?;
        let response = self.read_response(pending.clamp(1, HANDSHAKE_MAX_LEN))?;
        if !response.contains(&HANDSHAKE_ACK) {
            return Err(DriverError::Connect {
                port: self.port_name.clone(),
                response,
            });
        }
        debug!("handshake ok: device={}, reply={:02X?}", self.name, response);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    /// Send one command byte, then wait out the settle delay.
    pub fn write(&mut self, command: Command) -> Result<()> {
        let settle = self.response_timeout;
        let transport = self.transport_mut()?;
        transport
            .write_all(&[encode_command(command)])
            .map_err(DriverError::from_link)?;
        transport.flush().map_err(DriverError::from_link)?;
        debug!("sent {:?} ({:?})", command, encode_command(command) as char);
        std::thread::sleep(settle);
        Ok(())
    }

    pub fn fill_buffer(&mut self) -> Result<()> {
        self.write(Command::FillBuffer)
    }

    /// Raise sensitivity one step; counts as one calibration iteration.
    pub fn increment(&mut self) -> Result<()> {
        self.write(Command::Increment)?;
        self.calibration_iterations += 1;
        Ok(())
    }

    pub fn decrement(&mut self) -> Result<()> {
        self.write(Command::Decrement)
    }

    /// Reset device calibration and the iteration count.
    pub fn reset(&mut self) -> Result<()> {
        self.write(Command::Reset)?;
        self.calibration_iterations = 0;
        Ok(())
    }

    /// Block (bounded by the response timeout) for one full buffer and decode it.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let raw = self.read_response(BUFFER_WIDTH)?;
        Ok(self.layout.decode(&raw)?)
    }

    /// `fill_buffer()` followed by `read_frame()`.
    pub fn sample(&mut self) -> Result<Frame> {
        self.fill_buffer()?;
        self.read_frame()
    }

    /// Drain every byte currently buffered by the OS without waiting for more.
    pub fn read_available(&mut self) -> Result<Vec<u8>> {
        let pending = self
            .transport_mut()?
            .bytes_available()
            .map_err(DriverError::from_link)?;
        if pending == 0 {
            return Ok(Vec::new());
        }
        self.read_response(pending)
    }

    /// Quiesce the device and verify nothing is left on the link.
    pub fn flush(&mut self) -> Result<()> {
        self.write(Command::Flush)?;
        self.transport_mut()?
            .clear_buffers()
            .map_err(DriverError::from_link)?;
        let stray = self.read_available()?;
        if !stray.is_empty() {
            return Err(DriverError::Flush { stray: stray.len() });
        }
        Ok(())
    }

    /// Flush, disconnect and release the link. Never fails; problems are logged.
    pub fn close(&mut self) {
        if self.transport.is_none() {
            return;
        }
        if let Err(e) = self.flush() {
            warn!("flush on close failed: device={}, error={}", self.name, e);
        }
        if let Err(e) = self.write(Command::Disconnect) {
            warn!("disconnect failed: device={}, error={}", self.name, e);
        }
        self.release();
        info!("device session closed: device={}", self.name);
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn calibration_iterations(&self) -> u32 {
        self.calibration_iterations
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport.as_mut().ok_or(DriverError::NotConnected)
    }

    /// Drop the link without running the close protocol.
    pub(crate) fn release(&mut self) {
        if self.transport.take().is_some() {
            debug!("released link: port={}", self.port_name);
        }
    }

    /// Read up to `len` bytes, stopping early on timeout.
    fn read_response(&mut self, len: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.response_timeout;
        let transport = self.transport_mut()?;
        let mut buf = vec![0u8; len];
        let mut filled = 0usize;

        while filled < len {
            match transport.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    break
                }
                Err(e) => return Err(DriverError::from_link(e)),
            }

            if filled < len && Instant::now() > deadline {
                break;
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FrameError;
    use crate::mock::{test_settings, FakeDevice, FakeOpener};

    fn open_fake(device: &FakeDevice, channels: usize) -> Result<DeviceSession> {
        let opener = FakeOpener::new().with_port("/dev/ttyFAKE0", device.clone());
        DeviceSession::open(
            &opener,
            "forearm",
            &PortHandle::new("/dev/ttyFAKE0", Some("SN0")),
            FrameLayout::with_channels(channels).unwrap(),
            &test_settings(),
        )
    }

    #[test]
    fn open_performs_handshake() {
        let device = FakeDevice::new();
        let session = open_fake(&device, 8).unwrap();
        assert!(session.is_open());
        assert_eq!(device.commands(), vec![Command::Connect]);
        assert_eq!(device.opens(), 1);
    }

    #[test]
    fn failed_handshake_releases_link() {
        let device = FakeDevice::new().with_handshake(b"XYZ");
        let err = open_fake(&device, 8).unwrap_err();
        assert!(matches!(err, DriverError::Connect { ref response, .. } if response == b"XYZ"));
        assert_eq!(device.released(), 1);
        // Released without the close protocol.
        assert_eq!(device.commands(), vec![Command::Connect]);
    }

    #[test]
    fn silent_device_fails_handshake_without_hanging() {
        let device = FakeDevice::new().with_handshake(b"");
        let err = open_fake(&device, 8).unwrap_err();
        assert!(matches!(err, DriverError::Connect { ref response, .. } if response.is_empty()));
    }

    #[test]
    fn connect_failure_on_attached_session_leaves_link_open() {
        let device = FakeDevice::new().with_handshake(b"N");
        let mut session = DeviceSession::attach(
            "forearm",
            "/dev/ttyFAKE0",
            Box::new(device.transport()),
            FrameLayout::with_channels(8).unwrap(),
            Duration::from_millis(1),
        );
        assert!(session.connect().is_err());
        assert!(session.is_open());
        session.close();
        assert!(!session.is_open());
        assert_eq!(device.released(), 1);
    }

    #[test]
    fn read_frame_decodes_device_buffer() {
        let device = FakeDevice::new().with_frames(&[[1, 2, 3, 4, 5, 6, 7, 8]]);
        let mut session = open_fake(&device, 7).unwrap();
        let frame = session.sample().unwrap();
        assert_eq!(frame.as_slice(), &[8, 7, 6, 5, 4, 3, 1]);
    }

    #[test]
    fn read_frame_without_data_is_short_frame() {
        let device = FakeDevice::new();
        let mut session = open_fake(&device, 8).unwrap();
        let err = session.read_frame().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Frame(FrameError::Short { actual: 0, .. })
        ));
    }

    #[test]
    fn flush_fails_on_stray_byte() {
        let device = FakeDevice::new().with_stray_after_clear();
        let mut session = open_fake(&device, 8).unwrap();
        assert!(matches!(
            session.flush(),
            Err(DriverError::Flush { stray: 1 })
        ));
    }

    #[test]
    fn flush_succeeds_on_quiet_link() {
        let device = FakeDevice::new();
        let mut session = open_fake(&device, 8).unwrap();
        session.flush().unwrap();
        assert_eq!(device.clears(), 1);
    }

    #[test]
    fn close_flushes_then_disconnects_once() {
        let device = FakeDevice::new();
        let mut session = open_fake(&device, 8).unwrap();
        session.close();
        session.close();
        assert_eq!(
            device.commands(),
            vec![Command::Connect, Command::Flush, Command::Disconnect]
        );
        assert_eq!(device.released(), 1);
        assert!(matches!(session.fill_buffer(), Err(DriverError::NotConnected)));
    }

    #[test]
    fn close_after_disconnect_does_not_panic() {
        let device = FakeDevice::new().failing_after(0);
        let mut session = open_fake(&device, 8).unwrap();
        assert!(matches!(
            session.fill_buffer(),
            Err(DriverError::Disconnected(_))
        ));
        session.close();
        assert!(!session.is_open());
        assert_eq!(device.released(), 1);
    }

    #[test]
    fn drop_closes_session() {
        let device = FakeDevice::new();
        {
            let _session = open_fake(&device, 8).unwrap();
        }
        assert_eq!(device.released(), 1);
        assert_eq!(device.commands().last(), Some(&Command::Disconnect));
    }

    #[test]
    fn write_waits_for_settle_delay() {
        let device = FakeDevice::new();
        let mut session = DeviceSession::attach(
            "forearm",
            "/dev/ttyFAKE0",
            Box::new(device.transport()),
            FrameLayout::with_channels(8).unwrap(),
            Duration::from_millis(15),
        );
        let start = Instant::now();
        session.write(Command::FillBuffer).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn reset_clears_iteration_count() {
        let device = FakeDevice::new();
        let mut session = open_fake(&device, 8).unwrap();
        session.increment().unwrap();
        session.increment().unwrap();
        session.decrement().unwrap();
        assert_eq!(session.calibration_iterations(), 2);
        session.reset().unwrap();
        assert_eq!(session.calibration_iterations(), 0);
    }
}
