//! Frame relay server with a synthetic encoder
//!
//! Run with: cargo run --example relay_server [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example relay_server                    # binds to 0.0.0.0:4747
//!   cargo run --example relay_server localhost          # binds to 127.0.0.1:4747
//!   cargo run --example relay_server 127.0.0.1:4800     # binds to 127.0.0.1:4800
//!
//! ## Receiving video
//!
//! Any TCP client that sends a line containing "video" receives packets:
//!
//!   printf 'GET /video/avc HTTP/1.1\r\n\r\n' | nc localhost 4747 | xxd | head
//!
//! Each packet is an 8-byte big-endian timestamp (ms), a 4-byte big-endian
//! length, then that many bytes of Annex-B H.264.
//!
//! ## Recording control
//!
//!   printf 'start' | nc localhost 4747      # replies "200 OK"
//!   printf 'stop' | nc localhost 4747

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use camstream::media::AvcConfig;
use camstream::registry::Packet;
use camstream::session::SessionContext;
use camstream::{
    BroadcastServer, EncodedAccessUnit, EncoderSink, ServerConfig, StreamHandler, VideoCodec,
};

/// avcC record for a 1280x720 High profile stream, level 3.1
const AVC_RECORD: &[u8] = &[
    0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, // header, 1 SPS
    0x00, 0x0A, 0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, // SPS
    0x01, 0x00, 0x04, 0x68, 0xEB, 0xE3, 0xCB, // 1 PPS
];

const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const GOP_LENGTH: u64 = 30;

/// Handler that logs control events and counts recorded bytes
struct RelayHandler {
    recording: AtomicBool,
    recorded_bytes: AtomicU64,
    recorded_packets: AtomicU64,
}

impl RelayHandler {
    fn new() -> Self {
        Self {
            recording: AtomicBool::new(false),
            recorded_bytes: AtomicU64::new(0),
            recorded_packets: AtomicU64::new(0),
        }
    }

    fn print_stats(&self) {
        println!(
            "Recording stats: packets={} bytes={}",
            self.recorded_packets.load(Ordering::Relaxed),
            self.recorded_bytes.load(Ordering::Relaxed),
        );
    }
}

impl StreamHandler for RelayHandler {
    async fn on_connection(&self, ctx: &SessionContext) -> bool {
        println!("[{}] New connection from {}", ctx.connection_id, ctx.peer_addr);
        true
    }

    async fn on_disconnect(&self, ctx: &SessionContext, remaining: usize) {
        println!(
            "[{}] Disconnected ({} clients remaining)",
            ctx.connection_id, remaining
        );
    }

    async fn on_start_recording(&self, ctx: &SessionContext) {
        println!("[{}] Recording started", ctx.connection_id);
        self.recording.store(true, Ordering::Relaxed);
    }

    async fn on_stop_recording(&self, ctx: &SessionContext) {
        println!("[{}] Recording stopped", ctx.connection_id);
        self.recording.store(false, Ordering::Relaxed);
        self.print_stats();
    }

    async fn on_codec_selected(&self, ctx: &SessionContext, codec: VideoCodec) {
        println!(
            "[{}] Codec requested: {} ({})",
            ctx.connection_id,
            codec,
            codec.mime_type()
        );
    }

    async fn on_access_unit(&self, packet: &Packet) {
        if !self.recording.load(Ordering::Relaxed) {
            return;
        }

        self.recorded_packets.fetch_add(1, Ordering::Relaxed);
        self.recorded_bytes
            .fetch_add(packet.length() as u64, Ordering::Relaxed);

        tracing::trace!(
            timestamp_ms = packet.timestamp_ms,
            keyframe = packet.is_keyframe,
            "Recorded access unit"
        );
    }

    async fn on_encode_error(&self, error: &camstream::error::EncodeError, was_recording: bool) {
        eprintln!("Encoder error: {}", error);
        if was_recording {
            self.recording.store(false, Ordering::Relaxed);
            self.print_stats();
        }
    }
}

/// Feed fake H.264 access units at 30 fps from a plain thread, the way a
/// hardware encoder callback would
fn spawn_encoder(sink: EncoderSink, config: AvcConfig) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let started = Instant::now();

        for frame in 0u64.. {
            if sink.is_closed() {
                break;
            }

            let keyframe = frame % GOP_LENGTH == 0;
            let nal_header = if keyframe { 0x65 } else { 0x41 };
            let body_len = if keyframe { 4096 } else { 512 };

            let mut payload = BytesMut::with_capacity(4 + body_len);
            payload.put_u32(body_len as u32);
            payload.put_u8(nal_header);
            payload.put_bytes((frame & 0xFF) as u8, body_len - 1);

            let pts = started.elapsed();
            let unit = if keyframe {
                config.keyframe(payload.freeze(), pts)
            } else {
                EncodedAccessUnit::new(payload.freeze(), pts)
            };

            sink.push(unit);
            std::thread::sleep(FRAME_INTERVAL);
        }
    })
}

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:4747
/// - "localhost:4800" -> 127.0.0.1:4800
/// - "127.0.0.1" -> 127.0.0.1:4747
/// - "0.0.0.0:4747" -> 0.0.0.0:4747
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, camstream::server::DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: relay_server [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:4747)");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  relay_server                     # binds to 0.0.0.0:4747");
    eprintln!("  relay_server localhost           # binds to 127.0.0.1:4747");
    eprintln!("  relay_server 127.0.0.1:4800      # binds to 127.0.0.1:4800");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let config = match args.get(1) {
        Some(addr_str) => match parse_bind_addr(addr_str) {
            Ok(addr) => ServerConfig::with_addr(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("camstream=debug".parse()?)
                .add_directive("relay_server=debug".parse()?),
        )
        .init();

    let avc = AvcConfig::parse(Bytes::from_static(AVC_RECORD))?;
    tracing::info!(
        profile = avc.profile,
        level = avc.level,
        sps = avc.sps.len(),
        pps = avc.pps.len(),
        "Synthetic encoder configured"
    );

    let server = Arc::new(BroadcastServer::new(config, RelayHandler::new()));
    let addr = server.start().await?;
    println!("Relaying synthetic video on {}", addr);

    let (sink, pump) = server.spawn_pump();
    let encoder = spawn_encoder(sink, avc);

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tracing::debug!(
                    clients = server.connection_count().await,
                    subscribers = server.subscriber_count().await,
                    recording = server.is_recording(),
                    "Relay status"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await;
    pump.abort();
    let _ = pump.await;
    let _ = encoder.join();
    server.handler().print_stats();

    Ok(())
}
