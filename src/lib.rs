//! Real-time video frame relay for camera capture apps
//!
//! Takes access units from a hardware encoder, rewrites them from AVCC
//! (length-prefixed NAL units) to Annex-B (start-code delimited), and fans
//! them out to any number of TCP clients. Clients subscribe and drive the
//! local recording with a small text protocol on the same socket.
//!
//! # Wire format
//!
//! ```text
//! +----------------------+------------------+--------------------+
//! | timestamp ms (u64 BE)| length L (u32 BE)| L bytes of Annex-B |
//! +----------------------+------------------+--------------------+
//! ```
//!
//! # Example
//! ```no_run
//! use camstream::{BroadcastServer, ServerConfig, StreamHandler};
//!
//! struct App;
//! impl StreamHandler for App {}
//!
//! # async fn example() -> camstream::error::Result<()> {
//! let server = std::sync::Arc::new(BroadcastServer::new(ServerConfig::default(), App));
//! server.start().await?;
//!
//! let (sink, _pump) = server.spawn_pump();
//! // hand `sink` to the encoder thread and call `sink.push(unit)` per frame
//! # drop(sink);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
pub use media::{EncodedAccessUnit, VideoCodec};
pub use registry::Packet;
pub use server::{BroadcastServer, EncoderSink, ServerConfig, StreamHandler};
