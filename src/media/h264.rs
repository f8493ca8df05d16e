//! H.264 `avcC` records
//!
//! Some encoders publish their SPS/PPS only inside an
//! AVCDecoderConfigurationRecord. `AvcConfig` pulls the parameter sets out
//! so keyframes can carry them into the reframer.
//!
//! ```text
//! 01 | profile | compat | level | 111111 ll | 111 nnnnn | (u16 len, SPS)*n
//!    | count | (u16 len, PPS)*count
//! ```
//!
//! `ll + 1` is the NAL length prefix size used by the access units. Only
//! 4-byte prefixes are accepted, matching `annexb::split_avcc`.

use std::time::Duration;

use bytes::{Buf, Bytes};

use crate::error::FormatError;

use super::annexb::LENGTH_PREFIX_SIZE;
use super::unit::EncodedAccessUnit;

/// Parameter sets taken from an `avcC` record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    /// profile_idc
    pub profile: u8,
    /// level_idc
    pub level: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse a record, rejecting anything the reframer could not consume
    pub fn parse(record: Bytes) -> Result<Self, FormatError> {
        let mut cursor = record;
        if cursor.remaining() < 6 || cursor.get_u8() != 1 {
            return Err(FormatError::InvalidAvcConfig);
        }

        let profile = cursor.get_u8();
        cursor.advance(1);
        let level = cursor.get_u8();

        let prefix_size = (cursor.get_u8() & 0x03) as usize + 1;
        if prefix_size != LENGTH_PREFIX_SIZE {
            return Err(FormatError::InvalidAvcConfig);
        }

        let sps_count = cursor.get_u8() & 0x1F;
        let sps = take_sets(&mut cursor, sps_count)?;

        if !cursor.has_remaining() {
            return Err(FormatError::InvalidAvcConfig);
        }
        let pps_count = cursor.get_u8();
        let pps = take_sets(&mut cursor, pps_count)?;

        if sps.is_empty() || pps.is_empty() {
            return Err(FormatError::InvalidAvcConfig);
        }

        Ok(Self {
            profile,
            level,
            sps,
            pps,
        })
    }

    /// All SPS followed by all PPS
    pub fn parameter_sets(&self) -> Vec<Bytes> {
        self.sps.iter().chain(&self.pps).cloned().collect()
    }

    /// Wrap an AVCC keyframe payload together with these parameter sets
    pub fn keyframe(&self, payload: Bytes, pts: Duration) -> EncodedAccessUnit {
        EncodedAccessUnit::keyframe(payload, self.parameter_sets(), pts)
    }
}

fn take_sets(cursor: &mut Bytes, count: u8) -> Result<Vec<Bytes>, FormatError> {
    (0..count)
        .map(|_| {
            if cursor.remaining() < 2 {
                return Err(FormatError::InvalidAvcConfig);
            }
            let len = cursor.get_u16() as usize;
            if cursor.remaining() < len {
                return Err(FormatError::InvalidAvcConfig);
            }
            Ok(cursor.split_to(len))
        })
        .collect()
}
