//! # Wire Frame Codec
//!
//! Encoding and decoding for the PBX audio-socket protocol. Every control
//! packet is `type (1 byte) | length (2 bytes, big-endian) | payload`.
//! A connection carries exactly one framed packet inbound — the session-id
//! handshake with a raw 16-byte UUID payload — and raw, unframed PCM in both
//! directions afterwards. The only framed packet the server ever emits is
//! `Terminate`, which tells the PBX to hang the call up.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use uuid::Uuid;

/// Bytes occupied by the type tag and length field.
pub const HEADER_LEN: usize = 3;

/// Payload length of a session-id handshake packet (a UUID with hyphens stripped).
pub const SESSION_ID_LEN: usize = 16;

/// Bytes per PCM sample (16-bit signed linear).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Packet kinds understood on the wire.
///
/// The tag values follow the PBX AudioSocket convention; anything else is a
/// protocol violation and tears the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Hang-up request / notification (empty payload)
    Terminate,
    /// Handshake carrying the 16 raw bytes of the call's UUID
    SessionId,
    /// Framed audio (only seen when a peer does not switch to raw media)
    Audio,
    /// Peer-reported error
    PeerError,
}

impl PacketKind {
    pub fn tag(self) -> u8 {
        match self {
            PacketKind::Terminate => 0x00,
            PacketKind::SessionId => 0x01,
            PacketKind::Audio => 0x10,
            PacketKind::PeerError => 0xff,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(PacketKind::Terminate),
            0x01 => Some(PacketKind::SessionId),
            0x10 => Some(PacketKind::Audio),
            0xff => Some(PacketKind::PeerError),
            _ => None,
        }
    }
}

/// A decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

/// Errors from a single encode/decode attempt.
///
/// `MalformedFrame` is not an error for the stream as a whole: the caller is
/// expected to buffer more bytes and retry the decode. The other variants are
/// genuine protocol violations.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: need {needed} bytes, have {available}")]
    MalformedFrame { needed: usize, available: usize },

    #[error("unknown packet type tag {0:#04x}")]
    UnknownKind(u8),

    #[error("payload of {0} bytes does not fit a 16-bit length field")]
    Oversize(usize),
}

/// Encode one packet: type tag, big-endian length, payload.
pub fn encode(kind: PacketKind, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > u16::MAX as usize {
        return Err(CodecError::Oversize(payload.len()));
    }

    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.push(kind.tag());
    let mut len = [0u8; 2];
    BigEndian::write_u16(&mut len, payload.len() as u16);
    packet.extend_from_slice(&len);
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Decode one packet from the front of `buf`.
///
/// Returns the packet and the number of bytes consumed; anything after the
/// consumed prefix belongs to the next packet (or, post-handshake, to the raw
/// media stream). Fails with `MalformedFrame` when fewer bytes than the
/// declared length are available — buffer and retry.
pub fn decode(buf: &[u8]) -> Result<(Packet, usize), CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::MalformedFrame {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }

    let kind = PacketKind::from_tag(buf[0]).ok_or(CodecError::UnknownKind(buf[0]))?;
    let declared = BigEndian::read_u16(&buf[1..3]) as usize;
    let total = HEADER_LEN + declared;

    if buf.len() < total {
        return Err(CodecError::MalformedFrame {
            needed: total,
            available: buf.len(),
        });
    }

    let payload = buf[HEADER_LEN..total].to_vec();
    Ok((Packet { kind, payload }, total))
}

/// Encode the session-id handshake packet for a call UUID.
pub fn encode_session_id(id: &Uuid) -> Vec<u8> {
    // 16-byte payload always fits, so encode cannot fail here
    encode(PacketKind::SessionId, id.as_bytes()).expect("uuid payload fits length field")
}

/// Encode a terminate (hang-up) packet.
pub fn encode_terminate() -> Vec<u8> {
    encode(PacketKind::Terminate, &[]).expect("empty payload fits length field")
}

/// Size in bytes of one outbound audio frame.
///
/// Derived from the deployment audio format: `sample_rate × 2 bytes/sample ×
/// frame_duration`. For 8 kHz 16-bit mono at 20 ms this is 320 bytes, which
/// is what the telephony side expects per frame.
pub fn frame_size(sample_rate: u32, frame_duration_ms: u32) -> usize {
    (sample_rate as usize * BYTES_PER_SAMPLE * frame_duration_ms as usize) / 1000
}
