//! Statistics for client connections and the encoder feed

use std::time::Duration;

/// Per-connection statistics, logged when the connection closes
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Total bytes received from the client
    pub bytes_received: u64,
    /// Total bytes written to the client
    pub bytes_sent: u64,
    /// Video packets written
    pub packets_sent: u64,
    /// Video packets overwritten in the queue before they could be written
    pub packets_dropped: u64,
    /// Control replies written
    pub replies_sent: u64,
    /// Recognized control commands
    pub commands_received: u64,
    /// Connection duration
    pub duration: Duration,
}

impl ConnectionStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbound bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            (self.bytes_sent * 8) / secs
        } else {
            0
        }
    }

    /// Fraction of video packets lost to backpressure
    pub fn drop_ratio(&self) -> f64 {
        let total = self.packets_sent + self.packets_dropped;
        if total > 0 {
            self.packets_dropped as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Fold the writer-side counters into this tracker
    pub fn merge(&mut self, other: &ConnectionStats) {
        self.bytes_received += other.bytes_received;
        self.bytes_sent += other.bytes_sent;
        self.packets_sent += other.packets_sent;
        self.packets_dropped += other.packets_dropped;
        self.replies_sent += other.replies_sent;
        self.commands_received += other.commands_received;
    }
}

/// Counters for the encoder handoff
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    /// Access units received from the encoder
    pub access_units: u64,
    /// Keyframes among them
    pub keyframes: u64,
    /// Units dropped because they failed to reframe
    pub malformed: u64,
    /// Units skipped because they reframed to nothing
    pub empty: u64,
    /// Annex-B bytes produced
    pub bytes_out: u64,
}

impl FeedStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate() {
        let stats = ConnectionStats {
            bytes_sent: 1_000_000,
            duration: Duration::from_secs(8),
            ..Default::default()
        };
        assert_eq!(stats.bitrate(), 1_000_000);

        let stats = ConnectionStats::new();
        assert_eq!(stats.bitrate(), 0);
    }

    #[test]
    fn test_drop_ratio() {
        let stats = ConnectionStats {
            packets_sent: 75,
            packets_dropped: 25,
            ..Default::default()
        };
        assert!((stats.drop_ratio() - 0.25).abs() < f64::EPSILON);
        assert_eq!(ConnectionStats::new().drop_ratio(), 0.0);
    }

    #[test]
    fn test_merge() {
        let mut reader = ConnectionStats {
            bytes_received: 10,
            commands_received: 1,
            ..Default::default()
        };
        let writer = ConnectionStats {
            bytes_sent: 100,
            packets_sent: 3,
            packets_dropped: 1,
            replies_sent: 1,
            ..Default::default()
        };

        reader.merge(&writer);
        assert_eq!(reader.bytes_received, 10);
        assert_eq!(reader.bytes_sent, 100);
        assert_eq!(reader.packets_sent, 3);
        assert_eq!(reader.packets_dropped, 1);
        assert_eq!(reader.replies_sent, 1);
        assert_eq!(reader.commands_received, 1);
    }
}
