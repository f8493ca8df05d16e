//! Handler context
//!
//! Context passed to handler callbacks identifying the connection that
//! triggered them.

use std::net::SocketAddr;

/// Context passed to StreamHandler callbacks
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Unique connection ID
    pub connection_id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,
}

impl SessionContext {
    /// Create a new context
    pub fn new(connection_id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            connection_id,
            peer_addr,
        }
    }
}
