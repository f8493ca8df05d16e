//! AVCC to Annex-B reframing
//!
//! Hardware encoders hand out access units in AVCC layout (each NAL unit
//! prefixed by its 4-byte big-endian length). Network decoders expect
//! Annex-B, where every NAL unit starts with `00 00 00 01`:
//!
//! ```text
//! AVCC:    | 00 00 00 05 | 65 88 84 00 00 | 00 00 00 02 | 06 05 |
//! Annex-B: | 00 00 00 01 | 65 88 84 00 00 | 00 00 00 01 | 06 05 |
//! ```
//!
//! Keyframes additionally get their parameter sets prepended, each behind
//! its own start code, so a client can start decoding at any IDR.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FormatError;

use super::unit::EncodedAccessUnit;

/// Annex-B start code
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Size of the AVCC NAL length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Split an AVCC payload into its NAL units
///
/// Fails if a length prefix is cut short or declares more bytes than remain.
/// The returned slices share the payload's allocation.
pub fn split_avcc(payload: &Bytes) -> Result<Vec<Bytes>, FormatError> {
    let mut nalus = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let remaining = payload.len() - offset;
        if remaining < LENGTH_PREFIX_SIZE {
            return Err(FormatError::TruncatedLengthPrefix { offset, remaining });
        }

        let len = u32::from_be_bytes([
            payload[offset],
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
        ]) as usize;
        let start = offset + LENGTH_PREFIX_SIZE;
        let remaining = payload.len() - start;

        if len > remaining {
            return Err(FormatError::TruncatedNalUnit {
                offset,
                declared: len,
                remaining,
            });
        }

        nalus.push(payload.slice(start..start + len));
        offset = start + len;
    }

    Ok(nalus)
}

/// Convert one access unit to an Annex-B buffer
///
/// Parameter sets are emitted only for keyframes. Either the whole unit is
/// converted or an error is returned; partial output is never produced. An
/// empty result means there is nothing to transmit.
pub fn reframe(unit: &EncodedAccessUnit) -> Result<Bytes, FormatError> {
    let parameter_sets: &[Bytes] = match &unit.parameter_sets {
        Some(sets) if unit.is_keyframe => sets,
        _ => &[],
    };

    let nalus = split_avcc(&unit.payload)?;

    let size: usize = parameter_sets
        .iter()
        .chain(nalus.iter())
        .map(|nal| START_CODE.len() + nal.len())
        .sum();

    let mut out = BytesMut::with_capacity(size);
    for nal in parameter_sets.iter().chain(nalus.iter()) {
        out.put_slice(&START_CODE);
        out.put_slice(nal);
    }

    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn avcc(nalus: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for nal in nalus {
            buf.put_u32(nal.len() as u32);
            buf.put_slice(nal);
        }
        buf.freeze()
    }

    #[test]
    fn test_reframe_single_nalu() {
        let unit = EncodedAccessUnit::new(
            avcc(&[&[0x41, 0x9A, 0x00]]),
            Duration::from_millis(40),
        );

        let out = reframe(&unit).unwrap();
        assert_eq!(&out[..], &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00]);
    }

    #[test]
    fn test_reframe_length_matches_nalu_count() {
        let nalus: [&[u8]; 3] = [&[0x06, 0x05, 0x11], &[0x41; 200], &[0x41; 7]];
        let unit = EncodedAccessUnit::new(avcc(&nalus), Duration::ZERO);

        let out = reframe(&unit).unwrap();
        let expected: usize = nalus.iter().map(|n| 4 + n.len()).sum();
        assert_eq!(out.len(), expected);
        assert_eq!(out.len(), 4 * 3 + 3 + 200 + 7);
    }

    #[test]
    fn test_reframe_keyframe_prepends_parameter_sets() {
        let sps = Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]);
        let pps = Bytes::from_static(&[0x68, 0xEF, 0x38]);
        let idr: &[u8] = &[0x65, 0x88, 0x84, 0x00, 0x00];
        let unit = EncodedAccessUnit::keyframe(
            avcc(&[idr]),
            vec![sps.clone(), pps.clone()],
            Duration::ZERO,
        );

        let out = reframe(&unit).unwrap();
        let header_len = 4 * 2 + sps.len() + pps.len();

        assert_eq!(&out[0..4], &START_CODE);
        assert_eq!(&out[4..8], &sps[..]);
        assert_eq!(&out[8..12], &START_CODE);
        assert_eq!(&out[12..15], &pps[..]);
        assert_eq!(&out[header_len..header_len + 4], &START_CODE);
        assert_eq!(&out[header_len + 4..], idr);
    }

    #[test]
    fn test_reframe_ignores_parameter_sets_on_non_keyframe() {
        let mut unit = EncodedAccessUnit::new(avcc(&[&[0x41, 0x01]]), Duration::ZERO);
        unit.parameter_sets = Some(vec![Bytes::from_static(&[0x67, 0x42])]);

        let out = reframe(&unit).unwrap();
        assert_eq!(&out[..], &[0x00, 0x00, 0x00, 0x01, 0x41, 0x01]);
    }

    #[test]
    fn test_reframe_empty_payload() {
        let unit = EncodedAccessUnit::new(Bytes::new(), Duration::ZERO);
        assert!(reframe(&unit).unwrap().is_empty());

        let unit = EncodedAccessUnit::keyframe(
            Bytes::new(),
            vec![Bytes::from_static(&[0x67, 0x42])],
            Duration::ZERO,
        );
        assert_eq!(&reframe(&unit).unwrap()[..], &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
    }

    #[test]
    fn test_reframe_truncated_nalu() {
        let payload = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x0A, // length = 10
            0x41, 0x9A, 0x00, // only 3 bytes
        ]);
        let unit = EncodedAccessUnit::new(payload, Duration::ZERO);

        assert_eq!(
            reframe(&unit),
            Err(FormatError::TruncatedNalUnit {
                offset: 0,
                declared: 10,
                remaining: 3,
            })
        );
    }

    #[test]
    fn test_reframe_truncated_length_prefix() {
        // One valid NALU followed by two stray bytes
        let payload = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x41, 0x00, 0x00]);
        let unit = EncodedAccessUnit::new(payload, Duration::ZERO);

        assert_eq!(
            reframe(&unit),
            Err(FormatError::TruncatedLengthPrefix {
                offset: 5,
                remaining: 2,
            })
        );
    }

    #[test]
    fn test_reframe_recovers_after_bad_unit() {
        let bad = EncodedAccessUnit::new(
            Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0x41]),
            Duration::ZERO,
        );
        let good = EncodedAccessUnit::new(avcc(&[&[0x41, 0x02]]), Duration::from_millis(33));

        assert!(reframe(&bad).is_err());
        assert_eq!(
            &reframe(&good).unwrap()[..],
            &[0x00, 0x00, 0x00, 0x01, 0x41, 0x02]
        );
    }

    #[test]
    fn test_split_avcc_zero_length_nalu() {
        let payload = Bytes::from_static(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x09]);
        let nalus = split_avcc(&payload).unwrap();
        assert_eq!(nalus.len(), 2);
        assert!(nalus[0].is_empty());
        assert_eq!(&nalus[1][..], &[0x09]);
    }
}
