//! Frame broadcast server
//!
//! Owns the listening socket, the connection registry and the recording
//! flag. Handles the TCP accept loop and spawns one task per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{ListenerError, Result};
use crate::media::{annexb, EncodedAccessUnit};
use crate::registry::{ClientHandle, ConnectionRegistry, Packet};
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::server::handler::StreamHandler;
use crate::server::pump::{self, EncoderSink};
use crate::session::SessionContext;
use crate::stats::FeedStats;

/// Relays encoded video to every subscribed TCP client
pub struct BroadcastServer<H: StreamHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
    recording: Arc<AtomicBool>,
    next_connection_id: Arc<AtomicU64>,
    connection_semaphore: Option<Arc<Semaphore>>,
    accept_task: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
}

impl<H: StreamHandler> BroadcastServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(config: ServerConfig, handler: H) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            handler: Arc::new(handler),
            registry: Arc::new(ConnectionRegistry::new()),
            recording: Arc::new(AtomicBool::new(false)),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            connection_semaphore,
            accept_task: Mutex::new(None),
        }
    }

    /// Get a reference to the connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the application handler
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener and start accepting connections
    ///
    /// Returns the bound address. Calling this while already running returns
    /// the current address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut accept_task = self.accept_task.lock().await;
        if let Some((addr, _)) = accept_task.as_ref() {
            return Ok(*addr);
        }

        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ListenerError {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError {
                addr: bind_addr,
                source,
            })?;

        tracing::info!(addr = %local_addr, "Frame server listening");

        let acceptor = Acceptor {
            config: self.config.clone(),
            handler: Arc::clone(&self.handler),
            registry: Arc::clone(&self.registry),
            recording: Arc::clone(&self.recording),
            next_connection_id: Arc::clone(&self.next_connection_id),
            connection_semaphore: self.connection_semaphore.clone(),
        };
        let task = tokio::spawn(acceptor.accept_loop(listener));
        *accept_task = Some((local_addr, task));

        Ok(local_addr)
    }

    /// Stop accepting and close every connection
    ///
    /// When this returns the registry is empty and no new connection can be
    /// registered until `start()` is called again. Packets broadcast
    /// afterwards go nowhere.
    pub async fn stop(&self) {
        let accept_task = self.accept_task.lock().await.take();
        if let Some((addr, task)) = accept_task {
            task.abort();
            let _ = task.await;
            tracing::info!(addr = %addr, "Frame server stopped accepting");
        }

        let drained = self.registry.drain().await;
        for handle in &drained {
            handle.close();
        }

        for handle in drained {
            let ctx = SessionContext::new(handle.id(), handle.peer_addr());
            self.handler.on_disconnect(&ctx, 0).await;
        }
    }

    /// Start, serve until `shutdown` resolves, then stop
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        tracing::info!("Shutdown signal received");
        self.stop().await;
        Ok(())
    }

    /// Address the listener is bound to, if running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.accept_task.lock().await.as_ref().map(|(addr, _)| *addr)
    }

    /// Queue a packet on every subscribed connection
    ///
    /// Never waits for a client to drain. Returns the number of connections
    /// the packet was queued for.
    pub async fn broadcast(&self, packet: Packet) -> usize {
        let sent = self.registry.broadcast(&packet).await;

        tracing::trace!(
            timestamp_ms = packet.timestamp_ms,
            bytes = packet.length(),
            keyframe = packet.is_keyframe,
            clients = sent,
            "Packet broadcast"
        );

        sent
    }

    /// Reframe an access unit, hand it to the recording sink and broadcast it
    ///
    /// A malformed unit is dropped and reported; the stream carries on with
    /// the next one. Returns the number of clients the packet was queued for.
    pub async fn publish(&self, unit: &EncodedAccessUnit) -> Result<usize> {
        match self.packetize(unit)? {
            Some(packet) => Ok(self.deliver(packet).await),
            None => Ok(0),
        }
    }

    /// Reframe an access unit into a wire packet; None if it carried no data
    pub(crate) fn packetize(&self, unit: &EncodedAccessUnit) -> Result<Option<Packet>> {
        let payload = match annexb::reframe(unit) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(
                    timestamp_ms = unit.timestamp_ms(),
                    error = %e,
                    "Dropping malformed access unit"
                );
                return Err(e.into());
            }
        };

        if payload.is_empty() {
            return Ok(None);
        }

        Ok(Some(Packet::from_access_unit(unit, payload)?))
    }

    /// Hand a packet to the recording sink, then to every subscriber
    pub(crate) async fn deliver(&self, packet: Packet) -> usize {
        self.handler.on_access_unit(&packet).await;
        self.broadcast(packet).await
    }

    /// Spawn the task that feeds encoder output to `publish`
    ///
    /// The returned sink never blocks and may be used from any thread. The
    /// task ends once every clone of the sink is dropped and yields the feed
    /// statistics.
    pub fn spawn_pump(self: &Arc<Self>) -> (EncoderSink, JoinHandle<FeedStats>) {
        let (sink, events) = EncoderSink::channel(self.config.handoff_capacity);
        let task = tokio::spawn(pump::run(Arc::clone(self), events));
        (sink, task)
    }

    /// Number of connected clients
    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Number of clients receiving video
    pub async fn subscriber_count(&self) -> usize {
        self.registry.subscribers().await.len()
    }

    /// Whether any client is receiving video
    pub async fn is_sending_video(&self) -> bool {
        self.registry.has_subscribers().await
    }

    /// Whether a recording is active
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Record a recording started or stopped outside the control protocol
    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    /// Clear the recording flag, returning whether it was set
    pub(crate) fn take_recording(&self) -> bool {
        self.recording.swap(false, Ordering::AcqRel)
    }
}

/// State moved into the accept loop task
struct Acceptor<H: StreamHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
    recording: Arc<AtomicBool>,
    next_connection_id: Arc<AtomicU64>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl<H: StreamHandler> Acceptor<H> {
    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            connection_id = connection_id,
            peer = %peer_addr,
            "New connection"
        );

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let ctx = SessionContext::new(connection_id, peer_addr);
        if !self.handler.on_connection(&ctx).await {
            tracing::info!(
                connection_id = connection_id,
                peer = %peer_addr,
                "Connection rejected by handler"
            );
            return;
        }

        // Registered before the task is spawned, so stop() sees every
        // connection once the accept loop is gone
        let (handle, packets) =
            ClientHandle::new(connection_id, peer_addr, self.config.client_queue_capacity);
        if let Err(e) = self.registry.insert(Arc::clone(&handle)).await {
            tracing::error!(error = %e, "Failed to register connection");
            return;
        }

        tracing::info!(
            connection_id = connection_id,
            peer = %peer_addr,
            "Client connected"
        );

        let connection = Connection::new(
            handle,
            Arc::clone(&self.handler),
            Arc::clone(&self.registry),
            Arc::clone(&self.recording),
            self.config.clone(),
        );

        tokio::spawn(async move {
            let _permit = permit;

            if let Err(e) = connection.run(socket, packets).await {
                tracing::debug!(
                    connection_id = connection_id,
                    error = %e,
                    "Connection error"
                );
            }
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bytes::{BufMut, Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::error::Error;
    use crate::media::VideoCodec;
    use crate::protocol::OK_REPLY;

    #[derive(Default)]
    struct Recorder {
        connections: AtomicUsize,
        disconnects: AtomicUsize,
        starts: AtomicUsize,
        avc_requests: AtomicUsize,
        access_units: AtomicUsize,
    }

    impl StreamHandler for Recorder {
        async fn on_connection(&self, _ctx: &SessionContext) -> bool {
            self.connections.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn on_disconnect(&self, _ctx: &SessionContext, _remaining: usize) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_start_recording(&self, _ctx: &SessionContext) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_codec_selected(&self, _ctx: &SessionContext, codec: VideoCodec) {
            if codec == VideoCodec::Avc {
                self.avc_requests.fetch_add(1, Ordering::SeqCst);
            }
        }

        async fn on_access_unit(&self, _packet: &Packet) {
            self.access_units.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig::with_addr("127.0.0.1:0".parse().unwrap())
    }

    async fn started() -> (Arc<BroadcastServer<Recorder>>, SocketAddr) {
        let server = Arc::new(BroadcastServer::new(local_config(), Recorder::default()));
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn wait_for_connections(server: &BroadcastServer<Recorder>, count: usize) {
        for _ in 0..200 {
            if server.connection_count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} connections", count);
    }

    async fn wait_for_subscribers(server: &BroadcastServer<Recorder>, count: usize) {
        for _ in 0..200 {
            if server.subscriber_count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} subscribers", count);
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn subscribe(addr: SocketAddr, request: &[u8]) -> TcpStream {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        client
    }

    async fn read_packet(client: &mut TcpStream) -> (u64, Bytes) {
        let mut header = [0u8; 12];
        client.read_exact(&mut header).await.unwrap();

        let timestamp = u64::from_be_bytes(header[..8].try_into().unwrap());
        let length = u32::from_be_bytes(header[8..].try_into().unwrap()) as usize;

        let mut payload = vec![0u8; length];
        client.read_exact(&mut payload).await.unwrap();
        (timestamp, Bytes::from(payload))
    }

    fn avcc(nalus: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for nal in nalus {
            buf.put_u32(nal.len() as u32);
            buf.put_slice(nal);
        }
        buf.freeze()
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let (server, addr) = started().await;

        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr().await, Some(addr));
        // Second start is a no-op
        assert_eq!(server.start().await.unwrap(), addr);

        server.stop().await;
        assert_eq!(server.local_addr().await, None);
    }

    #[tokio::test]
    async fn test_bind_failure_is_listener_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig::with_addr(taken.local_addr().unwrap());
        let server = BroadcastServer::new(config, Recorder::default());

        let result = server.start().await;
        assert!(matches!(result, Err(Error::Listener(_))));
    }

    #[tokio::test]
    async fn test_subscribed_client_receives_packets() {
        let (server, addr) = started().await;
        let mut client = subscribe(addr, b"GET /video/avc HTTP/1.1\r\n\r\n").await;
        wait_for_subscribers(&server, 1).await;

        assert_eq!(server.handler().avc_requests.load(Ordering::SeqCst), 1);
        assert!(server.is_sending_video().await);

        let sps: &[u8] = &[0x67, 0x64, 0x00, 0x1F];
        let pps: &[u8] = &[0x68, 0xEF, 0x38];
        let unit = EncodedAccessUnit::keyframe(
            avcc(&[&[0x65, 0x88, 0x84]]),
            vec![Bytes::from_static(sps), Bytes::from_static(pps)],
            Duration::from_millis(1234),
        );
        assert_eq!(server.publish(&unit).await.unwrap(), 1);

        let (timestamp, payload) = read_packet(&mut client).await;
        assert_eq!(timestamp, 1234);
        assert_eq!(
            &payload[..],
            &[
                0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x1F, // SPS
                0x00, 0x00, 0x00, 0x01, 0x68, 0xEF, 0x38, // PPS
                0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, // IDR
            ]
        );
        assert_eq!(server.handler().access_units.load(Ordering::SeqCst), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_client_gets_nothing() {
        let (server, addr) = started().await;
        let mut idle = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 1).await;

        let unit = EncodedAccessUnit::new(avcc(&[&[0x41, 0x9A]]), Duration::ZERO);
        assert_eq!(server.publish(&unit).await.unwrap(), 0);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), idle.read(&mut buf)).await;
        assert!(read.is_err(), "idle client should not receive data");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_command_replies_ok() {
        let (server, addr) = started().await;
        let mut client = subscribe(addr, b"start").await;

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();

        assert_eq!(&reply[..], OK_REPLY);
        assert_eq!(server.handler().starts.load(Ordering::SeqCst), 1);
        assert!(server.is_recording());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_broken_client_does_not_affect_others() {
        let (server, addr) = started().await;
        let mut healthy = subscribe(addr, b"video").await;
        let broken = subscribe(addr, b"video").await;
        wait_for_subscribers(&server, 2).await;

        drop(broken);

        for ts in 0..20u64 {
            let unit = EncodedAccessUnit::new(
                avcc(&[&[0x41, ts as u8]]),
                Duration::from_millis(ts * 33),
            );
            server.publish(&unit).await.unwrap();
        }

        for ts in 0..20u64 {
            let (timestamp, payload) = read_packet(&mut healthy).await;
            assert_eq!(timestamp, ts * 33);
            assert_eq!(&payload[..], &[0x00, 0x00, 0x00, 0x01, 0x41, ts as u8]);
        }

        wait_for_connections(&server, 1).await;
        wait_until(|| server.handler().disconnects.load(Ordering::SeqCst) == 1).await;

        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_unit_does_not_end_stream() {
        let (server, addr) = started().await;
        let mut client = subscribe(addr, b"video").await;
        wait_for_subscribers(&server, 1).await;

        let bad = EncodedAccessUnit::new(
            Bytes::from_static(&[0x00, 0x00, 0x00, 0x09, 0x41]),
            Duration::from_millis(10),
        );
        assert!(matches!(server.publish(&bad).await, Err(Error::Format(_))));

        let good = EncodedAccessUnit::new(avcc(&[&[0x41, 0x01]]), Duration::from_millis(20));
        assert_eq!(server.publish(&good).await.unwrap(), 1);

        let (timestamp, _) = read_packet(&mut client).await;
        assert_eq!(timestamp, 20);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_every_connection() {
        let (server, addr) = started().await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = subscribe(addr, b"video").await;
        wait_for_connections(&server, 2).await;
        wait_for_subscribers(&server, 1).await;

        server.stop().await;

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.handler().disconnects.load(Ordering::SeqCst), 2);

        for client in [&mut first, &mut second] {
            let mut buf = [0u8; 16];
            let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .expect("socket left open");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        // Sends after stop are silently abandoned
        let unit = EncodedAccessUnit::new(avcc(&[&[0x41]]), Duration::ZERO);
        assert_eq!(server.publish(&unit).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_while_publishing() {
        let (server, addr) = started().await;
        let _a = subscribe(addr, b"video").await;
        let _b = subscribe(addr, b"video").await;
        wait_for_subscribers(&server, 2).await;

        let publisher = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                for ts in 0..2000u64 {
                    let unit = EncodedAccessUnit::new(
                        avcc(&[&[0x41, 0x9A]]),
                        Duration::from_millis(ts),
                    );
                    server.publish(&unit).await?;
                    tokio::task::yield_now().await;
                }
                Ok::<_, Error>(())
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        server.stop().await;

        publisher.await.unwrap().unwrap();
        assert_eq!(server.connection_count().await, 0);
        assert!(!server.is_sending_video().await);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = local_config().max_connections(1);
        let server = BroadcastServer::new(config, Recorder::default());
        let addr = server.start().await.unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("rejected socket left open");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.connection_count().await, 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_ids_increase() {
        let (server, addr) = started().await;
        let _a = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 1).await;
        let _b = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 2).await;

        assert!(server.registry().get(1).await.is_some());
        assert!(server.registry().get(2).await.is_some());
        assert_eq!(server.handler().connections.load(Ordering::SeqCst), 2);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (server, _) = started().await;
        server.stop().await;

        let addr = server.start().await.unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 1).await;

        server.stop().await;
    }
}
