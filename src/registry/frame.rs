//! Broadcast packet type
//!
//! A packet is built once per access unit and shared by every subscribed
//! client. It is cheap to clone due to `Bytes` reference counting.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FormatError;
use crate::media::EncodedAccessUnit;

/// Size of the packet header on the wire (timestamp + length)
pub const PACKET_HEADER_SIZE: usize = 8 + 4;

/// A reframed access unit ready to be written to clients
///
/// Wire layout: `[u64 BE timestamp ms][u32 BE length][payload]`. The length
/// field is derived from the payload, so it always matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Presentation timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Annex-B payload (zero-copy via reference counting)
    payload: Bytes,
    /// Whether the payload starts with a keyframe
    pub is_keyframe: bool,
}

impl Packet {
    /// Create a packet, rejecting payloads that overflow the length field
    pub fn new(timestamp_ms: u64, payload: Bytes) -> Result<Self, FormatError> {
        if payload.len() > u32::MAX as usize {
            return Err(FormatError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            timestamp_ms,
            payload,
            is_keyframe: false,
        })
    }

    /// Create a packet for a reframed access unit
    pub fn from_access_unit(unit: &EncodedAccessUnit, payload: Bytes) -> Result<Self, FormatError> {
        let mut packet = Self::new(unit.timestamp_ms(), payload)?;
        packet.is_keyframe = unit.is_keyframe;
        Ok(packet)
    }

    /// Annex-B payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Value of the length field
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Total size on the wire
    pub fn wire_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Encode the packet header
    pub fn header(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        header[..8].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        header[8..].copy_from_slice(&self.length().to_be_bytes());
        header
    }

    /// Encode header and payload into one contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        buf.put_slice(&self.header());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
