//! Shared-memory naming and geometry configuration

use std::time::Duration;

use super::layout::{Geometry, DEFAULT_MAX_FRAME_SIZE, DEFAULT_RING_SIZE};
use crate::channel::ChannelId;

/// Names, geometry and wait behaviour of the per-channel rings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmConfig {
    /// Segment name prefix; the channel suffix `_ch{id}` is appended
    pub segment_prefix: String,

    /// Write-exclusion semaphore name prefix
    pub write_lock_prefix: String,

    /// Read-notification semaphore name prefix
    pub notify_prefix: String,

    /// Number of slots per ring
    pub ring_size: u32,

    /// Slot payload capacity in bytes
    pub max_frame_size: u32,

    /// Longest single block inside a consumer wait. Bounds how long a
    /// consumer can go without noticing a destroyed producer.
    pub wait_slice: Duration,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            segment_prefix: "/video_stream".into(),
            write_lock_prefix: "/video_sem_write".into(),
            notify_prefix: "/video_sem_read".into(),
            ring_size: DEFAULT_RING_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            wait_slice: Duration::from_millis(100),
        }
    }
}

impl ShmConfig {
    /// Isolated name set, e.g. `/{ns}_video_stream_ch0`
    pub fn namespace(mut self, ns: &str) -> Self {
        self.segment_prefix = format!("/{}_video_stream", ns);
        self.write_lock_prefix = format!("/{}_video_sem_write", ns);
        self.notify_prefix = format!("/{}_video_sem_read", ns);
        self
    }

    pub fn ring_size(mut self, slots: u32) -> Self {
        self.ring_size = slots;
        self
    }

    pub fn max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice = slice;
        self
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.ring_size, self.max_frame_size)
    }

    pub fn segment_name(&self, channel: ChannelId) -> String {
        format!("{}_ch{}", self.segment_prefix, channel.index())
    }

    pub fn write_lock_name(&self, channel: ChannelId) -> String {
        format!("{}_ch{}", self.write_lock_prefix, channel.index())
    }

    pub fn notify_name(&self, channel: ChannelId) -> String {
        format!("{}_ch{}", self.notify_prefix, channel.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let config = ShmConfig::default();
        assert_eq!(config.segment_name(ChannelId::High), "/video_stream_ch0");
        assert_eq!(config.write_lock_name(ChannelId::Medium), "/video_sem_write_ch1");
        assert_eq!(config.notify_name(ChannelId::Low), "/video_sem_read_ch2");
    }

    #[test]
    fn test_namespace() {
        let config = ShmConfig::default().namespace("cam7");
        assert_eq!(config.segment_name(ChannelId::Low), "/cam7_video_stream_ch2");
        assert_eq!(config.notify_name(ChannelId::High), "/cam7_video_sem_read_ch0");
    }

    #[test]
    fn test_builder_chaining() {
        let config = ShmConfig::default()
            .ring_size(8)
            .max_frame_size(4000)
            .wait_slice(Duration::from_millis(10));

        assert_eq!(config.ring_size, 8);
        assert_eq!(config.wait_slice, Duration::from_millis(10));
        assert_eq!(config.geometry().max_frame_size, 4000);
        assert_eq!(config.geometry().ring_size, 8);
    }
}
