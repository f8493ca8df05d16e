//! Error types
//!
//! Each variant maps to one failure scope: a single access unit, a single
//! connection, the listener, or the upstream encoder.

use std::io;
use std::net::SocketAddr;

pub use crate::registry::RegistryError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Underlying I/O failure
    Io(io::Error),
    /// Malformed bitstream (scope: one access unit)
    Format(FormatError),
    /// Socket failure on a client connection (scope: one connection)
    Connection(ConnectionError),
    /// Bind/listen failure (scope: whole server)
    Listener(ListenerError),
    /// Failure reported by the encoder collaborator
    Encode(EncodeError),
    /// Registry invariant violation
    Registry(RegistryError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Format(e) => write!(f, "Format error: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Listener(e) => write!(f, "Listener error: {}", e),
            Error::Encode(e) => write!(f, "Encode error: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Format(e) => Some(e),
            Error::Connection(e) => Some(e),
            Error::Listener(e) => Some(e),
            Error::Encode(e) => Some(e),
            Error::Registry(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<FormatError> for Error {
    fn from(e: FormatError) -> Self {
        Error::Format(e)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::Connection(e)
    }
}

impl From<ListenerError> for Error {
    fn from(e: ListenerError) -> Self {
        Error::Listener(e)
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Error::Encode(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

/// Malformed encoder output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Fewer than 4 bytes left where a NAL length prefix was expected
    TruncatedLengthPrefix { offset: usize, remaining: usize },
    /// NAL length prefix points past the end of the payload
    TruncatedNalUnit {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    /// AVCDecoderConfigurationRecord could not be parsed
    InvalidAvcConfig,
    /// Payload does not fit the 32-bit length field of a packet
    PayloadTooLarge(usize),
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatError::TruncatedLengthPrefix { offset, remaining } => write!(
                f,
                "Truncated NAL length prefix at offset {} ({} bytes left)",
                offset, remaining
            ),
            FormatError::TruncatedNalUnit {
                offset,
                declared,
                remaining,
            } => write!(
                f,
                "NAL unit at offset {} declares {} bytes but only {} remain",
                offset, declared, remaining
            ),
            FormatError::InvalidAvcConfig => write!(f, "Invalid AVC decoder configuration record"),
            FormatError::PayloadTooLarge(len) => write!(f, "Payload too large: {} bytes", len),
        }
    }
}

impl std::error::Error for FormatError {}

/// Client socket failure
#[derive(Debug)]
pub enum ConnectionError {
    /// Read from the client failed
    Read(io::Error),
    /// Write to the client failed (broken pipe, reset)
    Write(io::Error),
    /// No data arrived within the configured idle timeout
    IdleTimeout,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Read(e) => write!(f, "read failed: {}", e),
            ConnectionError::Write(e) => write!(f, "write failed: {}", e),
            ConnectionError::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Read(e) | ConnectionError::Write(e) => Some(e),
            ConnectionError::IdleTimeout => None,
        }
    }
}

/// Listener could not be set up
#[derive(Debug)]
pub struct ListenerError {
    /// Address the server tried to bind
    pub addr: SocketAddr,
    /// Underlying cause
    pub source: io::Error,
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to listen on {}: {}", self.addr, self.source)
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Failure reported by the encoder or capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError {
    /// Human-readable reason, surfaced to the user as-is
    pub message: String,
}

impl EncodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EncodeError {}
