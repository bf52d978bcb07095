//! Statistics for channels and the stream server

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::channel::ChannelId;

/// Live counters updated from the encoder callback
#[derive(Debug)]
pub struct FrameCounters {
    started_at: Instant,
    frames: AtomicU64,
    keyframes: AtomicU64,
    bytes: AtomicU64,
    oversized: AtomicU64,
    last_timestamp_ms: AtomicU64,
}

impl Default for FrameCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCounters {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            frames: AtomicU64::new(0),
            keyframes: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
            last_timestamp_ms: AtomicU64::new(0),
        }
    }

    pub fn record(&self, size: usize, is_keyframe: bool, timestamp_ms: u64) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        self.last_timestamp_ms.store(timestamp_ms, Ordering::Relaxed);
    }

    /// A frame that did not fit a ring slot
    pub fn record_oversized(&self) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn keyframes(&self) -> u64 {
        self.keyframes.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn oversized(&self) -> u64 {
        self.oversized.load(Ordering::Relaxed)
    }

    pub fn last_timestamp_ms(&self) -> u64 {
        self.last_timestamp_ms.load(Ordering::Relaxed)
    }

    /// Get duration since the channel started
    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Calculate bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration().as_secs();
        if secs > 0 {
            (self.bytes() * 8) / secs
        } else {
            0
        }
    }

    /// Calculate the observed framerate
    pub fn framerate(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.frames() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Point-in-time view of one channel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub channel: u8,
    pub active: bool,
    /// Frames handed over by the encoder
    pub frames_in: u64,
    pub keyframes: u64,
    pub bytes_in: u64,
    /// Bits per second since start
    pub bitrate: u64,
    pub framerate: f64,
    /// Frames completed in the shared ring
    pub ring_frames: u32,
    /// Frames dropped on ring write contention
    pub ring_dropped: u32,
    /// Frames too large for a ring slot
    pub ring_oversized: u64,
    /// Local shared-memory readers
    pub ring_readers: i32,
    pub queue_len: usize,
    /// Frames evicted from the full network queue
    pub queue_dropped: u64,
    pub connections: usize,
    pub frames_dispatched: u64,
    pub evictions: u64,
}

impl ChannelStats {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel: channel.index(),
            ..Default::default()
        }
    }

    /// Share of encoder frames that never reached the network queue head
    pub fn queue_drop_ratio(&self) -> f64 {
        if self.frames_in == 0 {
            0.0
        } else {
            self.queue_dropped as f64 / self.frames_in as f64
        }
    }
}

/// Server-wide statistics
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
}

/// Snapshot of `ServerStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a close is only ever recorded after its open
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn handshake_rejected(&self) {
        self.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_counters_record() {
        let counters = FrameCounters::new();
        counters.record(1000, true, 10);
        counters.record(500, false, 43);
        counters.record_oversized();

        assert_eq!(counters.frames(), 2);
        assert_eq!(counters.keyframes(), 1);
        assert_eq!(counters.bytes(), 1500);
        assert_eq!(counters.oversized(), 1);
        assert_eq!(counters.last_timestamp_ms(), 43);
    }

    #[test]
    fn test_frame_counters_zero_duration() {
        let counters = FrameCounters::new();
        counters.record(1000, false, 1);
        // Less than a second elapsed
        assert_eq!(counters.bitrate(), 0);
    }

    #[test]
    fn test_queue_drop_ratio() {
        let mut stats = ChannelStats::new(ChannelId::Medium);
        assert_eq!(stats.channel, 1);
        assert_eq!(stats.queue_drop_ratio(), 0.0);

        stats.frames_in = 40;
        stats.queue_dropped = 10;
        assert!((stats.queue_drop_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_server_stats() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.handshake_rejected();
        stats.connection_closed();
        stats.connection_closed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.rejected_handshakes, 1);
    }
}
