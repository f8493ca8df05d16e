//! Connection registry and packet fan-out
//!
//! The registry tracks every connected client and routes packets from the
//! encoder to the clients that subscribed to video.
//!
//! # Architecture
//!
//! ```text
//!                     Arc<ConnectionRegistry>
//!                 ┌─────────────────────────────┐
//!                 │ connections: HashMap<id,    │
//!                 │   ClientHandle {            │
//!                 │     wants_video,            │
//!                 │     tx: broadcast::Tx,      │
//!                 │   }                         │
//!                 │ >                           │
//!                 └──────────────┬──────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//!   [Encoder pump]         [Connection 1]          [Connection 2]
//!   broadcast()            packet_rx.recv()        packet_rx.recv()
//!        │                       │                       │
//!        └──► enqueue() ────────►└──► write_all() ──► TCP
//! ```
//!
//! Every connection has its own bounded queue, so a slow client only ever
//! loses its own oldest packets, and then resumes at the next keyframe.
//! Packets share one allocation across all queues via `bytes::Bytes`.

pub mod entry;
pub mod error;
pub mod frame;
pub mod store;

pub use entry::ClientHandle;
pub use error::RegistryError;
pub use frame::{Packet, PACKET_HEADER_SIZE};
pub use store::ConnectionRegistry;
