//! Encoder output types

use std::time::Duration;

use bytes::Bytes;

/// Video codec a client can ask the encoder to switch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// H.264 / AVC
    Avc,
    /// H.265 / HEVC
    Hevc,
}

impl VideoCodec {
    /// MIME type understood by platform encoders
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::Avc => "video/avc",
            VideoCodec::Hevc => "video/hevc",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::Avc => f.write_str("AVC"),
            VideoCodec::Hevc => f.write_str("HEVC"),
        }
    }
}

/// One encoded frame as produced by the hardware encoder
///
/// The payload is in AVCC layout: a sequence of `[u32 BE length][NAL unit]`.
/// Parameter sets (SPS/PPS, plus VPS for HEVC) are only emitted in front of
/// keyframes.
#[derive(Debug, Clone)]
pub struct EncodedAccessUnit {
    /// Length-prefixed NAL units
    pub payload: Bytes,
    /// Whether this is a sync sample (IDR)
    pub is_keyframe: bool,
    /// Out-of-band decoder configuration, in the order it must be sent
    pub parameter_sets: Option<Vec<Bytes>>,
    /// Presentation time on the encoder's monotonic clock
    pub presentation_timestamp: Duration,
}

impl EncodedAccessUnit {
    /// Create a non-keyframe access unit
    pub fn new(payload: Bytes, presentation_timestamp: Duration) -> Self {
        Self {
            payload,
            is_keyframe: false,
            parameter_sets: None,
            presentation_timestamp,
        }
    }

    /// Create a keyframe carrying its parameter sets
    pub fn keyframe(
        payload: Bytes,
        parameter_sets: Vec<Bytes>,
        presentation_timestamp: Duration,
    ) -> Self {
        Self {
            payload,
            is_keyframe: true,
            parameter_sets: Some(parameter_sets),
            presentation_timestamp,
        }
    }

    /// Presentation time truncated to whole milliseconds
    pub fn timestamp_ms(&self) -> u64 {
        self.presentation_timestamp.as_millis() as u64
    }
}
