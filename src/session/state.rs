//! Connection state machine
//!
//! Tracks one client connection from accept to teardown:
//!
//! ```text
//! Connecting ──► Ready ──► Subscribed ──┐
//!      │           │        ▲    │      │
//!      │           │        └────┘      │
//!      └───────────┴──────► Closing ◄───┘
//!                              │
//!                              ▼
//!                           Closed
//! ```

use std::net::SocketAddr;
use std::time::Instant;

use crate::media::VideoCodec;

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Accepted, not yet registered
    Connecting,
    /// Registered, reading control messages
    Ready,
    /// Client asked for video
    Subscribed,
    /// Read loop ended, teardown in progress
    Closing,
    /// Deregistered and socket dropped
    Closed,
}

/// State owned by a single connection task
#[derive(Debug)]
pub struct ConnectionState {
    /// Connection id
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current phase
    pub phase: ConnectionPhase,

    /// Accept time
    pub connected_at: Instant,

    /// First video subscription
    pub subscribed_at: Option<Instant>,

    /// Last codec this client asked for
    pub requested_codec: Option<VideoCodec>,
}

impl ConnectionState {
    /// Create state for a freshly accepted connection
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: ConnectionPhase::Connecting,
            connected_at: Instant::now(),
            subscribed_at: None,
            requested_codec: None,
        }
    }

    /// Connection registered and its loops are about to run
    pub fn ready(&mut self) {
        if self.phase == ConnectionPhase::Connecting {
            self.phase = ConnectionPhase::Ready;
        }
    }

    /// Client subscribed to video; repeated subscriptions are allowed
    pub fn subscribe(&mut self, codec: Option<VideoCodec>) {
        if matches!(self.phase, ConnectionPhase::Ready | ConnectionPhase::Subscribed) {
            self.phase = ConnectionPhase::Subscribed;
            self.subscribed_at.get_or_insert_with(Instant::now);
            if codec.is_some() {
                self.requested_codec = codec;
            }
        }
    }

    /// Start teardown
    pub fn close(&mut self) {
        if self.phase != ConnectionPhase::Closed {
            self.phase = ConnectionPhase::Closing;
        }
    }

    /// Teardown finished
    pub fn finish(&mut self) {
        if self.phase == ConnectionPhase::Closing {
            self.phase = ConnectionPhase::Closed;
        }
    }

    /// Whether the client is receiving video
    pub fn is_subscribed(&self) -> bool {
        self.phase == ConnectionPhase::Subscribed
    }

    /// Whether the connection is still serving requests
    pub fn is_open(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Ready | ConnectionPhase::Subscribed)
    }

    /// Get connection duration
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }
}
