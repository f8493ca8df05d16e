//! Inline control protocol
//!
//! Clients talk to the server with plain ASCII on the same socket that
//! carries video. Requests are recognized by substring, so a raw keyword
//! (`video`, `start`) and an HTTP-style request line
//! (`GET /video/avc HTTP/1.1\r\n\r\n`) are both understood.
//!
//! | Substring            | Command                               |
//! |----------------------|---------------------------------------|
//! | `video`              | subscribe to video                    |
//! | `/avc`, `/hvec`      | ...and request that codec (with video)|
//! | `start`              | start local recording, reply `200 OK` |
//! | `stop`               | stop local recording, reply `200 OK`  |
//! | `HTTP/1.1\r\n\r\n`   | bare probe, reply `200 OK`            |
//!
//! A chunk maps to at most one command, checked in the order of the table.
//! Video subscriptions are never answered with text since the reply would
//! land in the middle of the binary packet stream.

use crate::media::VideoCodec;

/// Reply sent for recording commands and probes
pub const OK_REPLY: &[u8] = b"200 OK\r\n\r\n";

const VIDEO: &str = "video";
const AVC_SUFFIX: &str = "/avc";
const HEVC_SUFFIX: &str = "/hvec";
const START: &str = "start";
const STOP: &str = "stop";
const PROBE: &str = "HTTP/1.1\r\n\r\n";

/// A recognized client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start sending video, optionally switching the encoder codec first
    Subscribe { codec: Option<VideoCodec> },
    /// Start the local recording
    StartRecording,
    /// Stop the local recording
    StopRecording,
    /// Connectivity check
    Probe,
}

impl ControlCommand {
    /// Recognize the command in one inbound chunk
    ///
    /// Returns `None` for chunks that match nothing; they are ignored.
    pub fn parse(chunk: &[u8]) -> Option<Self> {
        let request = String::from_utf8_lossy(chunk);

        if request.contains(VIDEO) {
            let codec = if request.contains(AVC_SUFFIX) {
                Some(VideoCodec::Avc)
            } else if request.contains(HEVC_SUFFIX) {
                Some(VideoCodec::Hevc)
            } else {
                None
            };
            Some(ControlCommand::Subscribe { codec })
        } else if request.contains(START) {
            Some(ControlCommand::StartRecording)
        } else if request.contains(STOP) {
            Some(ControlCommand::StopRecording)
        } else if request.contains(PROBE) {
            Some(ControlCommand::Probe)
        } else {
            None
        }
    }

    /// Bytes to write back, if this command is answered
    pub fn reply(&self) -> Option<&'static [u8]> {
        match self {
            ControlCommand::Subscribe { .. } => None,
            ControlCommand::StartRecording
            | ControlCommand::StopRecording
            | ControlCommand::Probe => Some(OK_REPLY),
        }
    }
}
