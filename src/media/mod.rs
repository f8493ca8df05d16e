//! Media handling
//!
//! This module provides:
//! - Encoder output types (access units, codec selection)
//! - AVCC to Annex-B reframing
//! - H.264 decoder configuration parsing

pub mod annexb;
pub mod h264;
pub mod unit;

pub use annexb::{reframe, split_avcc, START_CODE};
pub use h264::AvcConfig;
pub use unit::{EncodedAccessUnit, VideoCodec};
