//! Per-connection task
//!
//! Each accepted socket is split in two halves that are driven concurrently
//! inside one task:
//!
//! - the read loop parses control requests and updates this connection's
//!   state;
//! - the frame writer is the only code that writes to the socket. It drains
//!   the connection's packet queue and the replies produced by the read
//!   loop, one at a time, so writes never interleave.
//!
//! Whichever side finishes first (EOF, read error, write error or a close
//! request from the server) ends the connection. Teardown deregisters the
//! connection exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

use crate::error::ConnectionError;
use crate::protocol::ControlCommand;
use crate::registry::{ClientHandle, ConnectionRegistry, Packet};
use crate::server::config::ServerConfig;
use crate::server::handler::StreamHandler;
use crate::session::{ConnectionState, SessionContext};
use crate::stats::ConnectionStats;

/// Replies buffered between the read loop and the writer
const REPLY_QUEUE_CAPACITY: usize = 8;

/// Why a connection ended
#[derive(Debug)]
pub enum CloseReason {
    /// Client closed its side
    PeerClosed,
    /// Socket failure or idle timeout
    Failed(ConnectionError),
    /// Server asked the connection to close
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::Failed(e) => write!(f, "{}", e),
            CloseReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// A single client connection
pub struct Connection<H: StreamHandler> {
    ctx: SessionContext,
    state: ConnectionState,
    handle: Arc<ClientHandle>,
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
    recording: Arc<AtomicBool>,
    config: ServerConfig,
    stats: ConnectionStats,
}

impl<H: StreamHandler> Connection<H> {
    /// Create a connection for a handle that is already registered
    pub fn new(
        handle: Arc<ClientHandle>,
        handler: Arc<H>,
        registry: Arc<ConnectionRegistry>,
        recording: Arc<AtomicBool>,
        config: ServerConfig,
    ) -> Self {
        Self {
            ctx: SessionContext::new(handle.id(), handle.peer_addr()),
            state: ConnectionState::new(handle.id(), handle.peer_addr()),
            handle,
            handler,
            registry,
            recording,
            config,
            stats: ConnectionStats::new(),
        }
    }

    /// Serve the socket until it closes, then tear down
    pub async fn run(
        mut self,
        socket: TcpStream,
        packets: broadcast::Receiver<Packet>,
    ) -> Result<(), ConnectionError> {
        let (reader, writer) = socket.into_split();
        let reason = self.serve(reader, writer, packets).await;
        self.teardown(&reason).await;

        match reason {
            CloseReason::Failed(e) => Err(e),
            CloseReason::PeerClosed | CloseReason::Shutdown => Ok(()),
        }
    }

    /// Drive the read loop and the writer until one of them stops
    ///
    /// Both halves are dropped when this returns, which closes the socket.
    pub(crate) async fn serve<R, W>(
        &mut self,
        mut reader: R,
        writer: W,
        packets: broadcast::Receiver<Packet>,
    ) -> CloseReason
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
        let mut frames = FrameWriter::new(writer, packets, reply_rx);
        let handle = Arc::clone(&self.handle);

        self.state.ready();
        tracing::debug!(
            connection_id = self.ctx.connection_id,
            peer = %self.ctx.peer_addr,
            "Connection ready"
        );

        let reason = tokio::select! {
            result = self.read_loop(&mut reader, &reply_tx) => match result {
                Ok(()) => CloseReason::PeerClosed,
                Err(e) => CloseReason::Failed(e),
            },
            result = frames.run() => match result {
                Ok(()) => CloseReason::Shutdown,
                Err(e) => CloseReason::Failed(e),
            },
            _ = handle.closed() => CloseReason::Shutdown,
        };

        // Replies to the last requests may still be queued. A packet cut off
        // mid-write leaves the stream unframed, so nothing may follow it.
        let flush = !frames.mid_packet
            && !matches!(
                reason,
                CloseReason::Shutdown | CloseReason::Failed(ConnectionError::Write(_))
            );
        if flush {
            let linger = self.config.linger_timeout;
            if let Ok(Err(e)) = tokio::time::timeout(linger, frames.flush_replies()).await {
                tracing::debug!(
                    connection_id = self.ctx.connection_id,
                    error = %e,
                    "Failed to flush pending replies"
                );
            }
        }

        self.stats.merge(&frames.stats);
        reason
    }

    async fn read_loop<R>(
        &mut self,
        reader: &mut R,
        replies: &mpsc::Sender<&'static [u8]>,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = match self.config.idle_timeout {
                Some(timeout) => tokio::time::timeout(timeout, reader.read(&mut buf))
                    .await
                    .map_err(|_| ConnectionError::IdleTimeout)?,
                None => reader.read(&mut buf).await,
            }
            .map_err(ConnectionError::Read)?;

            if n == 0 {
                return Ok(());
            }
            self.stats.bytes_received += n as u64;

            let Some(command) = ControlCommand::parse(&buf[..n]) else {
                tracing::trace!(
                    connection_id = self.ctx.connection_id,
                    bytes = n,
                    "Ignoring unrecognized request"
                );
                continue;
            };

            self.stats.commands_received += 1;
            self.handle_command(command).await;

            if let Some(reply) = command.reply() {
                if replies.send(reply).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_command(&mut self, command: ControlCommand) {
        let id = self.ctx.connection_id;

        match command {
            ControlCommand::Subscribe { codec } => {
                if let Some(codec) = codec {
                    let recording = self.recording.load(Ordering::Acquire);
                    let streaming = self
                        .registry
                        .subscribers()
                        .await
                        .iter()
                        .any(|other| other.id() != id);

                    if recording || streaming {
                        tracing::warn!(
                            connection_id = id,
                            codec = %codec,
                            recording = recording,
                            streaming = streaming,
                            "Codec change refused while encoder is in use"
                        );
                    } else {
                        tracing::info!(connection_id = id, codec = %codec, "Codec selected");
                        self.handler.on_codec_selected(&self.ctx, codec).await;
                    }
                }

                let first = !self.state.is_subscribed();
                self.state.subscribe(codec);
                self.handle.set_wants_video(true);

                if first {
                    tracing::info!(
                        connection_id = id,
                        peer = %self.ctx.peer_addr,
                        "Client subscribed to video"
                    );
                }
            }
            ControlCommand::StartRecording => {
                tracing::info!(connection_id = id, "Start recording requested");
                self.recording.store(true, Ordering::Release);
                self.handler.on_start_recording(&self.ctx).await;
            }
            ControlCommand::StopRecording => {
                tracing::info!(connection_id = id, "Stop recording requested");
                self.recording.store(false, Ordering::Release);
                self.handler.on_stop_recording(&self.ctx).await;
            }
            ControlCommand::Probe => {
                tracing::debug!(connection_id = id, "Probe");
            }
        }
    }

    async fn teardown(&mut self, reason: &CloseReason) {
        self.state.close();
        self.handle.set_wants_video(false);

        if self.registry.remove(self.ctx.connection_id).await.is_some() {
            let remaining = self.registry.len().await;
            self.handler.on_disconnect(&self.ctx, remaining).await;
        }

        self.stats.duration = self.state.duration();
        self.state.finish();

        tracing::info!(
            connection_id = self.ctx.connection_id,
            peer = %self.ctx.peer_addr,
            reason = %reason,
            bytes_sent = self.stats.bytes_sent,
            packets_sent = self.stats.packets_sent,
            packets_dropped = self.stats.packets_dropped,
            duration_ms = self.stats.duration.as_millis() as u64,
            "Connection closed"
        );
    }

    /// Statistics collected so far
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

/// Sole writer of a client socket
struct FrameWriter<W> {
    writer: W,
    packets: broadcast::Receiver<Packet>,
    replies: mpsc::Receiver<&'static [u8]>,
    stats: ConnectionStats,
    /// Set while a packet is partially written
    mid_packet: bool,
    /// Set after overwritten packets; cleared by the next keyframe
    awaiting_keyframe: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    fn new(
        writer: W,
        packets: broadcast::Receiver<Packet>,
        replies: mpsc::Receiver<&'static [u8]>,
    ) -> Self {
        Self {
            writer,
            packets,
            replies,
            stats: ConnectionStats::new(),
            mid_packet: false,
            awaiting_keyframe: false,
        }
    }

    /// Write until a queue closes or a write fails
    async fn run(&mut self) -> Result<(), ConnectionError> {
        while self.write_next().await? {}
        Ok(())
    }

    /// Write the next queued reply or packet
    ///
    /// Replies go first. Packets overwritten while this client was slow are
    /// counted as dropped, and so is everything after them up to the next
    /// keyframe, since those frames reference pictures the client never got.
    /// Returns false once a queue has closed.
    async fn write_next(&mut self) -> Result<bool, ConnectionError> {
        loop {
            tokio::select! {
                biased;

                reply = self.replies.recv() => {
                    let Some(reply) = reply else {
                        return Ok(false);
                    };
                    self.write_reply(reply).await?;
                    return Ok(true);
                }
                packet = self.packets.recv() => match packet {
                    Ok(packet) if self.awaiting_keyframe && !packet.is_keyframe => {
                        self.stats.packets_dropped += 1;
                    }
                    Ok(packet) => {
                        self.awaiting_keyframe = false;
                        self.write_packet(&packet).await?;
                        return Ok(true);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        self.stats.packets_dropped += skipped;
                        self.awaiting_keyframe = true;
                        tracing::debug!(
                            skipped = skipped,
                            "Slow client, skipping to next keyframe"
                        );
                    }
                    Err(RecvError::Closed) => return Ok(false),
                },
            }
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.mid_packet = true;
        self.writer
            .write_all(&packet.header())
            .await
            .map_err(ConnectionError::Write)?;
        self.writer
            .write_all(packet.payload())
            .await
            .map_err(ConnectionError::Write)?;
        self.mid_packet = false;
        self.writer.flush().await.map_err(ConnectionError::Write)?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.wire_size() as u64;
        Ok(())
    }

    async fn write_reply(&mut self, reply: &[u8]) -> Result<(), ConnectionError> {
        self.writer
            .write_all(reply)
            .await
            .map_err(ConnectionError::Write)?;
        self.writer.flush().await.map_err(ConnectionError::Write)?;

        self.stats.replies_sent += 1;
        self.stats.bytes_sent += reply.len() as u64;
        Ok(())
    }

    /// Write replies that are already queued, without waiting for more
    async fn flush_replies(&mut self) -> Result<(), ConnectionError> {
        while let Ok(reply) = self.replies.try_recv() {
            self.write_reply(reply).await?;
        }
        Ok(())
    }
}
