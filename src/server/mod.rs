//! Frame broadcast server
//!
//! One task accepts connections; each connection gets its own task that
//! reads control commands and drains a private packet queue to the socket.
//! A pump task moves encoder output into the registry.

pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod pump;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use connection::{CloseReason, Connection};
pub use handler::StreamHandler;
pub use listener::BroadcastServer;
pub use pump::{EncoderEvent, EncoderSink};
