//! Encoder handoff
//!
//! The encoder delivers output on its own thread and must never wait on the
//! network. `EncoderSink` queues units into a bounded channel without
//! blocking; a single pump task reframes and broadcasts them in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{EncodeError, Error};
use crate::media::EncodedAccessUnit;
use crate::server::handler::StreamHandler;
use crate::server::listener::BroadcastServer;
use crate::stats::FeedStats;

/// Event delivered by the encoder
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    /// One encoded access unit
    AccessUnit(EncodedAccessUnit),
    /// The encoder or capture session failed
    Error(EncodeError),
}

/// Non-blocking producer side of the encoder handoff
#[derive(Debug, Clone)]
pub struct EncoderSink {
    tx: mpsc::Sender<EncoderEvent>,
    dropped: Arc<AtomicU64>,
}

impl EncoderSink {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<EncoderEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Queue an access unit
    ///
    /// Returns false if the unit was dropped because the queue is full or
    /// the pump has ended.
    pub fn push(&self, unit: EncodedAccessUnit) -> bool {
        self.send(EncoderEvent::AccessUnit(unit))
    }

    /// Report an encoder failure
    pub fn report_error(&self, error: EncodeError) -> bool {
        self.send(EncoderEvent::Error(error))
    }

    /// Events dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the pump is still consuming events
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: EncoderEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    dropped = dropped,
                    keyframe = matches!(&event, EncoderEvent::AccessUnit(u) if u.is_keyframe),
                    "Encoder handoff full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Drain encoder events until every sink is dropped
pub(crate) async fn run<H: StreamHandler>(
    server: Arc<BroadcastServer<H>>,
    mut events: mpsc::Receiver<EncoderEvent>,
) -> FeedStats {
    let mut stats = FeedStats::new();

    while let Some(event) = events.recv().await {
        match event {
            EncoderEvent::AccessUnit(unit) => {
                stats.access_units += 1;
                if unit.is_keyframe {
                    stats.keyframes += 1;
                }

                match server.packetize(&unit) {
                    Ok(Some(packet)) => {
                        stats.bytes_out += packet.length() as u64;
                        server.deliver(packet).await;
                    }
                    Ok(None) => stats.empty += 1,
                    Err(Error::Format(_)) => stats.malformed += 1,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to packetize access unit");
                        stats.malformed += 1;
                    }
                }
            }
            EncoderEvent::Error(error) => {
                let was_recording = server.take_recording();
                tracing::error!(
                    error = %error,
                    was_recording = was_recording,
                    "Encoder failure"
                );
                server.handler().on_encode_error(&error, was_recording).await;
            }
        }
    }

    tracing::debug!(
        access_units = stats.access_units,
        keyframes = stats.keyframes,
        malformed = stats.malformed,
        bytes_out = stats.bytes_out,
        "Encoder pump finished"
    );

    stats
}
