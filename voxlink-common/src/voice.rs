//! Voice packet format
//!
//! Voice travels either inside a `UDPTunnel` control frame or as an
//! OCB-encrypted UDP datagram. Either way the inner packet is:
//!
//! ```text
//! +--------------------------------+
//! | header: (codec << 5) | target  |  1 byte
//! +--------------------------------+
//! | session id (varint)            |  server -> client only
//! +--------------------------------+
//! | sequence number (varint)       |
//! +--------------------------------+
//! | opus frame (self-delimited)    |  13-bit length + terminator bit
//! +--------------------------------+
//! ```
//!
//! The Opus frame is prefixed with one varint whose low 13 bits are the
//! frame length in bytes; bit 0x2000 marks the final frame of a
//! transmission.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::varint::{read_varint, write_varint};

/// Sample rate for voice audio (48 kHz, required by Opus)
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of audio channels (mono)
pub const CHANNELS: u16 = 1;

/// Frame duration in milliseconds
pub const FRAME_DURATION_MS: u32 = 10;

/// Samples per frame at 48 kHz with 10 ms frames
pub const FRAME_SIZE: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

/// Codec identifier for Opus in the voice packet header
pub const CODEC_OPUS: u8 = 4;

/// Header byte for a UDP ping datagram
pub const UDP_PING_HEADER: u8 = 0x20;

/// Mask for the length bits of a self-delimited Opus frame
pub const OPUS_LENGTH_MASK: i64 = 0x1FFF;

/// Terminator bit of a self-delimited Opus frame (last frame of a talk spurt)
pub const OPUS_TERMINATOR_BIT: i64 = 0x2000;

/// A parsed voice packet
///
/// `session` is only present on packets received from the server; packets
/// built for sending omit it (the server knows who we are).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePacket {
    /// Codec identifier (3 bits); this client only produces [`CODEC_OPUS`]
    pub codec: u8,
    /// Whisper/shout target (5 bits); 0 is normal talking
    pub target: u8,
    /// Speaker's session id (receive side only)
    pub session: Option<u32>,
    /// Sender's frame index at the codec frame rate
    pub sequence: i64,
    /// One Opus frame
    pub payload: Bytes,
    /// Set when this is the last frame of a transmission
    pub end_of_transmission: bool,
}

impl VoicePacket {
    /// Build an outgoing Opus voice packet (no session id)
    pub fn outgoing(target: u8, sequence: i64, payload: Bytes, end_of_transmission: bool) -> Self {
        Self {
            codec: CODEC_OPUS,
            target: target & 0x1F,
            session: None,
            sequence,
            payload,
            end_of_transmission,
        }
    }

    /// Serialize for transmission
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 10 + 2 + self.payload.len());

        buf.put_u8(((self.codec & 0x07) << 5) | (self.target & 0x1F));
        if let Some(session) = self.session {
            write_varint(&mut buf, session as i64);
        }
        write_varint(&mut buf, self.sequence);

        let mut opus_header = self.payload.len() as i64 & OPUS_LENGTH_MASK;
        if self.end_of_transmission {
            opus_header |= OPUS_TERMINATOR_BIT;
        }
        write_varint(&mut buf, opus_header);
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    /// Parse a client-built packet (no session id), as a server would
    pub fn from_outgoing_bytes(bytes: &[u8]) -> Option<Self> {
        let mut buf = Bytes::copy_from_slice(bytes);
        if !buf.has_remaining() {
            return None;
        }

        let header = buf.get_u8();
        let sequence = read_varint(&mut buf)?;
        let opus_header = read_varint(&mut buf)?;
        let len = (opus_header & OPUS_LENGTH_MASK) as usize;
        if buf.remaining() < len {
            return None;
        }

        Some(Self {
            codec: header >> 5,
            target: header & 0x1F,
            session: None,
            sequence,
            payload: buf.split_to(len),
            end_of_transmission: opus_header & OPUS_TERMINATOR_BIT != 0,
        })
    }

    /// Parse a packet received from the server (session id present)
    ///
    /// Returns `None` on truncated or malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut buf = Bytes::copy_from_slice(bytes);
        if !buf.has_remaining() {
            return None;
        }

        let header = buf.get_u8();
        let codec = header >> 5;
        let target = header & 0x1F;

        let session = read_varint(&mut buf)?;
        if session < 0 || session > u32::MAX as i64 {
            return None;
        }
        let sequence = read_varint(&mut buf)?;

        let opus_header = read_varint(&mut buf)?;
        let len = (opus_header & OPUS_LENGTH_MASK) as usize;
        if buf.remaining() < len {
            return None;
        }
        let payload = buf.split_to(len);

        Some(Self {
            codec,
            target,
            session: Some(session as u32),
            sequence,
            payload,
            end_of_transmission: opus_header & OPUS_TERMINATOR_BIT != 0,
        })
    }
}

/// Build a UDP ping datagram: `[0x20][timestamp_le:8]`
pub fn encode_udp_ping(timestamp_micros: u64) -> [u8; 9] {
    let mut packet = [0u8; 9];
    packet[0] = UDP_PING_HEADER;
    packet[1..].copy_from_slice(&timestamp_micros.to_le_bytes());
    packet
}

/// Extract the timestamp from a UDP ping reply, if it is one
pub fn decode_udp_ping(packet: &[u8]) -> Option<u64> {
    if packet.len() < 9 || packet[0] != UDP_PING_HEADER {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&packet[1..9]);
    Some(u64::from_le_bytes(bytes))
}
