//! Scripted in-memory armbands for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::SerialSettings;
use crate::errors::{DriverError, Result};
use crate::protocol::{Command, BUFFER_WIDTH};
use crate::session::{PortHandle, PortOpener, Transport};

pub fn test_settings() -> SerialSettings {
    SerialSettings {
        baud_rate: 250_000,
        response_timeout_ms: 1,
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    written: Vec<u8>,
    rx: VecDeque<u8>,
    frames: VecDeque<[u8; BUFFER_WIDTH]>,
    idle_frame: [u8; BUFFER_WIDTH],
    handshake: Vec<u8>,
    stray_after_clear: bool,
    fail_after_fills: Option<usize>,
    dead: bool,
    fills: usize,
    clears: usize,
    read_delay: Duration,
    opens: usize,
    released: usize,
}

/// Shared handle to one fake armband; clones observe the same device.
#[derive(Debug, Clone)]
pub struct FakeDevice(Arc<Mutex<DeviceState>>);

impl FakeDevice {
    pub fn new() -> Self {
        FakeDevice(Arc::new(Mutex::new(DeviceState {
            handshake: b"A".to_vec(),
            ..Default::default()
        })))
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.0.lock().unwrap()
    }

    /// Buffers returned, in order, for successive fill commands.
    pub fn with_frames(self, frames: &[[u8; BUFFER_WIDTH]]) -> Self {
        self.state().frames.extend(frames.iter().copied());
        self
    }

    /// Buffer returned once the scripted frames run out.
    pub fn with_idle_frame(self, frame: [u8; BUFFER_WIDTH]) -> Self {
        self.state().idle_frame = frame;
        self
    }

    pub fn with_handshake(self, reply: &[u8]) -> Self {
        self.state().handshake = reply.to_vec();
        self
    }

    pub fn with_stray_after_clear(self) -> Self {
        self.state().stray_after_clear = true;
        self
    }

    /// The link breaks on the fill command after `fills` successful ones.
    pub fn failing_after(self, fills: usize) -> Self {
        self.state().fail_after_fills = Some(fills);
        self
    }

    pub fn with_read_delay(self, delay: Duration) -> Self {
        self.state().read_delay = delay;
        self
    }

    pub fn transport(&self) -> FakeTransport {
        FakeTransport {
            device: self.clone(),
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state()
            .written
            .iter()
            .filter_map(|b| Command::from_byte(*b))
            .collect()
    }

    pub fn fills(&self) -> usize {
        self.state().fills
    }

    pub fn clears(&self) -> usize {
        self.state().clears
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    pub fn released(&self) -> usize {
        self.state().released
    }
}

fn broken() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

pub struct FakeTransport {
    device: FakeDevice,
}

impl Read for FakeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let delay = self.device.state().read_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self.device.state();
        if state.dead {
            return Err(broken());
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        let n = buf.len().min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for FakeTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.state();
        for &byte in buf {
            if state.dead {
                return Err(broken());
            }
            match Command::from_byte(byte) {
                Some(Command::Connect) => {
                    let reply = state.handshake.clone();
                    state.rx.extend(reply);
                }
                Some(Command::FillBuffer) => {
                    if state.fail_after_fills.is_some_and(|n| state.fills >= n) {
                        state.dead = true;
                        return Err(broken());
                    }
                    state.fills += 1;
                    let frame = state.frames.pop_front().unwrap_or(state.idle_frame);
                    state.rx.extend(frame);
                }
                _ => {}
            }
            state.written.push(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for FakeTransport {
    fn clear_buffers(&mut self) -> io::Result<()> {
        let mut state = self.device.state();
        if state.dead {
            return Err(broken());
        }
        state.clears += 1;
        state.rx.clear();
        if state.stray_after_clear {
            state.rx.push_back(0x55);
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let state = self.device.state();
        if state.dead {
            return Err(broken());
        }
        Ok(state.rx.len())
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.device.state().released += 1;
    }
}

/// Port opener backed by fake devices keyed by port name.
#[derive(Debug, Default, Clone)]
pub struct FakeOpener {
    ports: HashMap<String, FakeDevice>,
    refused: HashSet<String>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port_name: &str, device: FakeDevice) -> Self {
        self.ports.insert(port_name.to_string(), device);
        self
    }

    /// Opening this port fails at the OS level.
    pub fn refusing(mut self, port_name: &str) -> Self {
        self.refused.insert(port_name.to_string());
        self
    }
}

impl PortOpener for FakeOpener {
    fn open(&self, port: &PortHandle, _settings: &SerialSettings) -> Result<Box<dyn Transport>> {
        if self.refused.contains(&port.port_name) {
            return Err(DriverError::Serial(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                format!("{} is busy", port.port_name),
            )));
        }
        let device = self.ports.get(&port.port_name).ok_or_else(|| {
            DriverError::Serial(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                format!("{} does not exist", port.port_name),
            ))
        })?;
        device.state().opens += 1;
        Ok(Box::new(device.transport()))
    }
}
