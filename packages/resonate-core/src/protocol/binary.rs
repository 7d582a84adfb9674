//! Binary frame codec.
//!
//! One frame per WebSocket binary message:
//!
//! ```text
//! byte 0      uint8 message type (role in bits 7..2, slot in bits 1..0)
//! bytes 1..8  int64 big-endian, server-clock microseconds
//! bytes 9..   role-specific payload
//! ```
//!
//! The timestamp is decoded as signed; encoders refuse to produce negative
//! values. An empty payload on an artwork slot means "clear the channel".

use bytes::{BufMut, Bytes, BytesMut};

use super::messages::Role;
use super::CodecError;

/// Number of artwork channels addressable on the wire.
pub const ARTWORK_CHANNELS: u8 = 4;

/// Length of the type byte plus timestamp.
pub const HEADER_LEN: usize = 9;

/// Addressed role slot of a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryChannel {
    /// Slot 0 carries PCM/encoded audio chunks.
    Player(u8),
    /// Artwork channels 0..=3.
    Artwork(u8),
    /// Slot 0 carries feature frames.
    Visualizer(u8),
}

impl BinaryChannel {
    /// Audio chunk channel (player slot 0).
    pub const AUDIO: Self = Self::Player(0);

    /// Feature frame channel (visualizer slot 0).
    pub const FEATURES: Self = Self::Visualizer(0);

    /// Artwork channel `n`, which must be < [`ARTWORK_CHANNELS`].
    pub fn artwork(channel: u8) -> Result<Self, CodecError> {
        if channel < ARTWORK_CHANNELS {
            Ok(Self::Artwork(channel))
        } else {
            Err(CodecError::PayloadRange(format!(
                "artwork channel {channel} out of range"
            )))
        }
    }

    /// Role a peer must have declared to receive this channel.
    pub fn required_role(self) -> Role {
        match self {
            Self::Player(_) => Role::Player,
            Self::Artwork(_) => Role::Artwork,
            Self::Visualizer(_) => Role::Visualizer,
        }
    }

    /// Wire type byte: role index in bits 7..2, slot in bits 1..0.
    pub fn type_byte(self) -> u8 {
        match self {
            Self::Player(slot) => slot & 0x03,
            Self::Artwork(channel) => (1 << 2) | (channel & 0x03),
            Self::Visualizer(slot) => (2 << 2) | (slot & 0x03),
        }
    }

    fn from_type_byte(byte: u8) -> Result<Self, CodecError> {
        let slot = byte & 0x03;
        match byte >> 2 {
            0 => Ok(Self::Player(slot)),
            1 => Ok(Self::Artwork(slot)),
            2 => Ok(Self::Visualizer(slot)),
            _ => Err(CodecError::UnknownMessageType(format!(
                "binary type byte {byte:#04x}"
            ))),
        }
    }
}

/// A decoded (or to-be-encoded) binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub channel: BinaryChannel,
    /// Target presentation time, server-clock microseconds.
    pub timestamp: i64,
    pub payload: Bytes,
}

impl BinaryFrame {
    /// Builds a frame, rejecting negative presentation times.
    pub fn new(channel: BinaryChannel, timestamp: i64, payload: Bytes) -> Result<Self, CodecError> {
        if timestamp < 0 {
            return Err(CodecError::PayloadRange(format!(
                "negative presentation time {timestamp}"
            )));
        }
        Ok(Self {
            channel,
            timestamp,
            payload,
        })
    }

    /// Encodes to the wire layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.channel.type_byte());
        buf.put_i64(self.timestamp);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes from the wire layout. The payload is a zero-copy slice of
    /// the input buffer.
    pub fn decode(data: &Bytes) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::MalformedFrame(format!(
                "binary frame of {} bytes, need at least {HEADER_LEN}",
                data.len()
            )));
        }
        let channel = BinaryChannel::from_type_byte(data[0]);
        let channel = channel?;
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&data[1..HEADER_LEN]);
        Ok(Self {
            channel,
            timestamp: i64::from_be_bytes(ts_bytes),
            payload: data.slice(HEADER_LEN..),
        })
    }

    /// An empty payload on an artwork channel clears it.
    pub fn is_artwork_clear(&self) -> bool {
        matches!(self.channel, BinaryChannel::Artwork(_)) && self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_byte_layout() {
        assert_eq!(BinaryChannel::AUDIO.type_byte(), 0);
        assert_eq!(BinaryChannel::artwork(0).unwrap().type_byte(), 4);
        assert_eq!(BinaryChannel::artwork(3).unwrap().type_byte(), 7);
        assert_eq!(BinaryChannel::FEATURES.type_byte(), 8);
        assert!(BinaryChannel::artwork(4).is_err());
    }

    #[test]
    fn encodes_reference_frame() {
        // type=0, ts=1_234_567_890, payload [0xAA, 0xBB]
        let frame = BinaryFrame::new(
            BinaryChannel::AUDIO,
            1_234_567_890,
            Bytes::from_static(&[0xAA, 0xBB]),
        )
        .unwrap();
        let wire = frame.encode();
        assert_eq!(
            wire.as_ref(),
            &[0x00, 0x00, 0x00, 0x00, 0x00, 0x49, 0x96, 0x02, 0xD2, 0xAA, 0xBB]
        );
    }

    #[test]
    fn round_trips_any_channel() {
        for channel in [
            BinaryChannel::Player(0),
            BinaryChannel::Artwork(2),
            BinaryChannel::Visualizer(0),
        ] {
            let frame =
                BinaryFrame::new(channel, 42, Bytes::from_static(b"payload")).unwrap();
            let decoded = BinaryFrame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn rejects_short_and_unknown_frames() {
        let short = Bytes::from_static(&[0, 1, 2, 3]);
        assert!(matches!(
            BinaryFrame::decode(&short),
            Err(CodecError::MalformedFrame(_))
        ));

        let mut unknown = vec![12u8];
        unknown.extend_from_slice(&0i64.to_be_bytes());
        assert!(matches!(
            BinaryFrame::decode(&Bytes::from(unknown)),
            Err(CodecError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn rejects_negative_presentation_time() {
        assert!(matches!(
            BinaryFrame::new(BinaryChannel::AUDIO, -1, Bytes::new()),
            Err(CodecError::PayloadRange(_))
        ));
        // but negative timestamps decode as signed
        let mut wire = vec![0u8];
        wire.extend_from_slice(&(-5i64).to_be_bytes());
        let frame = BinaryFrame::decode(&Bytes::from(wire)).unwrap();
        assert_eq!(frame.timestamp, -5);
    }

    #[test]
    fn empty_artwork_payload_is_a_clear() {
        let clear =
            BinaryFrame::new(BinaryChannel::artwork(1).unwrap(), 7, Bytes::new()).unwrap();
        assert!(clear.is_artwork_clear());
        let audio = BinaryFrame::new(BinaryChannel::AUDIO, 7, Bytes::new()).unwrap();
        assert!(!audio.is_artwork_clear());
    }
}
