//! BIOX wire protocol: single-byte ASCII commands and fixed-width frames.
//!
//! The armband answers every `S` (fill buffer) command with exactly
//! [`BUFFER_WIDTH`] bytes. The device fills its ring buffer channel by channel and
//! the newest byte sits last, so logical channel `k` lives at `buffer[7 - k]`.
//!
//! Armbands with fewer than eight sensors still send a full buffer; the slot of
//! the physically absent sensor is dropped after the reverse indexing.

use serde::{Deserialize, Serialize};

use crate::errors::FrameError;

/// Width of every response buffer, in bytes.
pub const BUFFER_WIDTH: usize = 8;

/// Maximum number of sensor channels on one armband.
pub const MAX_CHANNELS: usize = BUFFER_WIDTH;

/// Logical slot without a sensor on seven-channel armbands.
pub const DEFAULT_ABSENT_CHANNEL: usize = 6;

/// Byte the device must include in its reply to `C`.
pub const HANDSHAKE_ACK: u8 = b'A';

/// Host → device commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Disconnect,
    /// Ask the device to sample its sensors into the response buffer.
    FillBuffer,
    /// Raise calibration sensitivity by one step.
    Increment,
    /// Lower calibration sensitivity by one step.
    Decrement,
    /// Reset calibration and clear the device's iteration count.
    Reset,
    /// Quiesce output so the link can be drained.
    Flush,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Connect,
        Command::Disconnect,
        Command::FillBuffer,
        Command::Increment,
        Command::Decrement,
        Command::Reset,
        Command::Flush,
    ];

    #[inline]
    pub fn as_byte(self) -> u8 {
        match self {
            Command::Connect => b'C',
            Command::Disconnect => b'D',
            Command::FillBuffer => b'S',
            Command::Increment => b'I',
            Command::Decrement => b'i',
            Command::Reset => b'R',
            Command::Flush => b'E',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Command::ALL.into_iter().find(|c| c.as_byte() == byte)
    }
}

/// Encode a command as the single byte sent on the wire.
#[inline]
pub fn encode_command(command: Command) -> u8 {
    command.as_byte()
}

/// One decoded multi-channel reading, in logical channel order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame {
    pub channels: Vec<u8>,
}

impl Frame {
    #[inline]
    pub fn new(channels: Vec<u8>) -> Self {
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.channels
    }

    /// Number of channels strictly above `threshold`.
    pub fn count_above(&self, threshold: u8) -> usize {
        self.channels.iter().filter(|&&v| v > threshold).count()
    }
}

impl From<Vec<u8>> for Frame {
    fn from(channels: Vec<u8>) -> Self {
        Frame::new(channels)
    }
}

/// How a device's buffer maps onto its logical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    channel_count: usize,
    absent_channel: usize,
}

impl FrameLayout {
    pub fn new(channel_count: usize, absent_channel: usize) -> Result<Self, FrameError> {
        if channel_count == 0 || channel_count > MAX_CHANNELS {
            return Err(FrameError::ChannelCount(channel_count));
        }
        if absent_channel >= MAX_CHANNELS {
            return Err(FrameError::AbsentChannel(absent_channel));
        }
        Ok(Self {
            channel_count,
            absent_channel,
        })
    }

    /// All eight channels, nothing dropped.
    pub const fn full() -> Self {
        Self {
            channel_count: MAX_CHANNELS,
            absent_channel: DEFAULT_ABSENT_CHANNEL,
        }
    }

    /// Layout with the default absent slot.
    pub fn with_channels(channel_count: usize) -> Result<Self, FrameError> {
        Self::new(channel_count, DEFAULT_ABSENT_CHANNEL)
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn absent_channel(&self) -> Option<usize> {
        (self.channel_count < MAX_CHANNELS).then_some(self.absent_channel)
    }

    /// Buffer index holding logical channel `channel` of the decoded frame.
    pub fn raw_index(&self, channel: usize) -> Option<usize> {
        if channel >= self.channel_count {
            return None;
        }
        let logical = match self.absent_channel() {
            Some(absent) if channel >= absent => channel + 1,
            _ => channel,
        };
        Some(BUFFER_WIDTH - 1 - logical)
    }

    /// Decode one full response buffer.
    pub fn decode(&self, buffer: &[u8]) -> Result<Frame, FrameError> {
        if buffer.len() < BUFFER_WIDTH {
            return Err(FrameError::Short {
                expected: BUFFER_WIDTH,
                actual: buffer.len(),
            });
        }
        if buffer.len() > BUFFER_WIDTH {
            return Err(FrameError::Long {
                expected: BUFFER_WIDTH,
                actual: buffer.len(),
            });
        }

        let mut channels: Vec<u8> = buffer.iter().rev().copied().collect();
        if let Some(absent) = self.absent_channel() {
            channels.remove(absent);
        }
        channels.truncate(self.channel_count);
        Ok(Frame::new(channels))
    }
}

/// Decode a buffer for a device with `channel_count` sensors and the default absent slot.
pub fn decode_frame(buffer: &[u8], channel_count: usize) -> Result<Frame, FrameError> {
    FrameLayout::with_channels(channel_count)?.decode(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes_match_wire_protocol() {
        let bytes: Vec<u8> = Command::ALL.iter().map(|c| encode_command(*c)).collect();
        assert_eq!(bytes, b"CDSIiRE");
        for c in Command::ALL {
            assert_eq!(Command::from_byte(c.as_byte()), Some(c));
        }
        assert_eq!(Command::from_byte(b'x'), None);
    }

    #[test]
    fn full_frame_uses_reverse_indexing() {
        let buffer = [10, 20, 30, 40, 50, 60, 70, 80];
        let layout = FrameLayout::with_channels(8).unwrap();
        let frame = layout.decode(&buffer).unwrap();
        assert_eq!(frame.as_slice(), &[80, 70, 60, 50, 40, 30, 20, 10]);

        // Put every decoded value back where the layout says it came from.
        let mut rebuilt = [0u8; BUFFER_WIDTH];
        for (channel, value) in frame.channels.iter().enumerate() {
            rebuilt[layout.raw_index(channel).unwrap()] = *value;
        }
        assert_eq!(rebuilt, buffer);
    }

    #[test]
    fn seven_channel_device_always_drops_same_slot() {
        let layout = FrameLayout::with_channels(7).unwrap();
        let buffers: [[u8; 8]; 3] = [
            [1, 2, 3, 4, 5, 6, 7, 8],
            [200, 0, 17, 99, 3, 255, 42, 8],
            [9, 9, 9, 9, 9, 9, 9, 9],
        ];
        for buffer in buffers {
            let frame = layout.decode(&buffer).unwrap();
            assert_eq!(frame.len(), 7);
            // Logical slot 6 is buffer[1]; it must never survive.
            let mut expected: Vec<u8> = buffer.iter().rev().copied().collect();
            expected.remove(DEFAULT_ABSENT_CHANNEL);
            assert_eq!(frame.channels, expected);
        }
        assert_eq!(layout.absent_channel(), Some(DEFAULT_ABSENT_CHANNEL));
        assert_eq!(layout.raw_index(6), Some(0));
        assert_eq!(layout.raw_index(7), None);
    }

    #[test]
    fn custom_absent_slot() {
        let layout = FrameLayout::new(7, 1).unwrap();
        let frame = layout.decode(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(frame.as_slice(), &[8, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn short_and_long_buffers_are_rejected() {
        assert_eq!(
            decode_frame(&[1, 2, 3], 8),
            Err(FrameError::Short {
                expected: 8,
                actual: 3
            })
        );
        assert_eq!(
            decode_frame(&[0; 9], 8),
            Err(FrameError::Long {
                expected: 8,
                actual: 9
            })
        );
        assert_eq!(
            decode_frame(&[], 8).unwrap_err().to_string(),
            "short frame buffer: expected 8 bytes, got 0"
        );
    }

    #[test]
    fn layout_validation() {
        assert_eq!(FrameLayout::with_channels(0), Err(FrameError::ChannelCount(0)));
        assert_eq!(FrameLayout::with_channels(9), Err(FrameError::ChannelCount(9)));
        assert_eq!(FrameLayout::new(7, 8), Err(FrameError::AbsentChannel(8)));
        assert_eq!(FrameLayout::with_channels(8).unwrap(), FrameLayout::full());
        assert_eq!(FrameLayout::full().absent_channel(), None);
    }

    #[test]
    fn small_devices_keep_leading_channels() {
        let frame = decode_frame(&[1, 2, 3, 4, 5, 6, 7, 8], 4).unwrap();
        assert_eq!(frame.as_slice(), &[8, 7, 6, 5]);
    }

    #[test]
    fn count_above_is_strict() {
        let frame = Frame::new(vec![117, 118, 200, 0]);
        assert_eq!(frame.count_above(117), 2);
    }
}
