//! Per-connection registry entry
//!
//! The registry never touches a client socket. It holds a `ClientHandle`:
//! the subscription flag, the sending side of the client's outbound queue,
//! and a signal used to ask the connection task to close its socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Notify};

use super::frame::Packet;

/// Shared handle to one client connection
#[derive(Debug)]
pub struct ClientHandle {
    id: u64,
    peer_addr: SocketAddr,
    connected_at: Instant,

    /// Set by the connection's own read loop when it asks for video
    wants_video: AtomicBool,

    /// Bounded outbound queue; overwrites the oldest packet when full
    tx: broadcast::Sender<Packet>,

    close: Notify,
}

impl ClientHandle {
    /// Create a handle and the receiving side of its outbound queue
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        queue_capacity: usize,
    ) -> (Arc<Self>, broadcast::Receiver<Packet>) {
        let (tx, rx) = broadcast::channel(queue_capacity.max(1));

        let handle = Arc::new(Self {
            id,
            peer_addr,
            connected_at: Instant::now(),
            wants_video: AtomicBool::new(false),
            tx,
            close: Notify::new(),
        });

        (handle, rx)
    }

    /// Connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// When the connection was accepted
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Whether this client has subscribed to video
    pub fn wants_video(&self) -> bool {
        self.wants_video.load(Ordering::Acquire)
    }

    pub(crate) fn set_wants_video(&self, wants: bool) {
        self.wants_video.store(wants, Ordering::Release);
    }

    /// Queue a packet for this client without waiting
    ///
    /// Returns false if the connection's writer is already gone.
    pub fn enqueue(&self, packet: Packet) -> bool {
        self.tx.send(packet).is_ok()
    }

    /// Number of packets waiting to be written
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Ask the connection task to close the socket
    ///
    /// The request is remembered if the task is not currently waiting.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once `close()` has been called
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::broadcast::error::RecvError;

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn packet(ts: u64) -> Packet {
        Packet::new(ts, Bytes::from_static(&[0, 0, 0, 1, 0x41])).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_preserves_order() {
        let (handle, mut rx) = ClientHandle::new(1, addr(), 8);

        for ts in 0..3 {
            assert!(handle.enqueue(packet(ts)));
        }

        for ts in 0..3 {
            assert_eq!(rx.recv().await.unwrap().timestamp_ms, ts);
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let (handle, mut rx) = ClientHandle::new(1, addr(), 2);

        for ts in 0..5 {
            handle.enqueue(packet(ts));
        }

        // Three oldest packets were overwritten
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().timestamp_ms, 3);
        assert_eq!(rx.recv().await.unwrap().timestamp_ms, 4);
    }

    #[tokio::test]
    async fn test_enqueue_after_writer_gone() {
        let (handle, rx) = ClientHandle::new(1, addr(), 4);
        drop(rx);

        assert!(!handle.enqueue(packet(0)));
    }

    #[tokio::test]
    async fn test_close_before_wait_is_remembered() {
        let (handle, _rx) = ClientHandle::new(7, addr(), 4);
        handle.close();

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("close signal lost");
    }

    #[test]
    fn test_wants_video_flag() {
        let (handle, _rx) = ClientHandle::new(3, addr(), 4);
        assert!(!handle.wants_video());

        handle.set_wants_video(true);
        assert!(handle.wants_video());
        assert_eq!(handle.id(), 3);
    }
}
