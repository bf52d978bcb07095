//! Per-channel runtime state
//!
//! A `ChannelContext` owns everything one channel needs: its ring producer,
//! its network queue and its connection registry. Contexts are built once
//! at startup by `ChannelSet::open` and torn down by `ChannelSet::shutdown`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ChannelConfig, ChannelId, ChannelInfo};
use crate::error::ShmError;
use crate::fanout::{ChannelQueue, ConnectionRegistry, FanoutConfig, PushOutcome, QueuedFrame};
use crate::frame::{now_ms, FrameMeta};
use crate::router::{ChannelRouter, SELECTOR_PARAM};
use crate::shm::{ProducerHandle, ShmConfig, WriteOutcome};
use crate::stats::{ChannelStats, FrameCounters};

/// What `on_frame` did with one encoder frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutcome {
    /// `None` when the frame could not go into the ring (too large, or the
    /// channel is inactive)
    pub ring: Option<WriteOutcome>,
    /// `None` when the channel is inactive
    pub queue: Option<PushOutcome>,
}

#[derive(Debug)]
pub struct ChannelContext {
    config: ChannelConfig,
    shm_path: String,
    producer: Mutex<Option<ProducerHandle>>,
    queue: Arc<ChannelQueue>,
    registry: Arc<ConnectionRegistry>,
    counters: FrameCounters,
    active: AtomicBool,
}

impl ChannelContext {
    /// Attach the channel's producer and build its fan-out
    pub fn open(config: ChannelConfig, shm: &ShmConfig, fanout: &FanoutConfig) -> Result<Self, ShmError> {
        let producer = ProducerHandle::attach(config.id, shm)?;
        let queue = Arc::new(ChannelQueue::new(config.id, fanout.queue_capacity));
        let registry = Arc::new(ConnectionRegistry::new(
            config.id,
            Arc::clone(&queue),
            fanout.clone(),
        ));

        tracing::info!(
            channel = %config.id,
            name = config.name(),
            width = config.width,
            height = config.height,
            fps = config.fps,
            codec = %config.codec,
            "Channel opened"
        );

        Ok(Self {
            shm_path: shm.segment_name(config.id),
            config,
            producer: Mutex::new(Some(producer)),
            queue,
            registry,
            counters: FrameCounters::new(),
            active: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.config.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<ChannelQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Encoder callback: publish one frame to local readers and to the
    /// network queue
    ///
    /// Runs on the encoder thread and never waits on readers or clients.
    /// A timestamp of 0 is replaced with the current time so both paths
    /// carry the same value.
    pub fn on_frame(&self, payload: Bytes, meta: FrameMeta) -> FrameOutcome {
        if !self.is_active() {
            return FrameOutcome {
                ring: None,
                queue: None,
            };
        }

        let mut meta = meta;
        if meta.capture_timestamp_ms == 0 {
            meta.capture_timestamp_ms = now_ms();
        }
        self.counters
            .record(payload.len(), meta.is_keyframe, meta.capture_timestamp_ms);

        let ring = match self.lock_producer().as_mut() {
            Some(producer) => match producer.write(&payload, &meta) {
                Ok(outcome) => Some(outcome),
                Err(ShmError::FrameTooLarge { size, max }) => {
                    self.counters.record_oversized();
                    tracing::warn!(channel = %self.config.id, size, max, "Frame too large for ring, skipped");
                    None
                }
                Err(e) => {
                    tracing::error!(channel = %self.config.id, error = %e, "Ring write failed");
                    None
                }
            },
            None => None,
        };

        let queue = self
            .queue
            .push(QueuedFrame::new(payload, meta.capture_timestamp_ms));

        FrameOutcome {
            ring,
            queue: Some(queue),
        }
    }

    /// Discovery record for this channel
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.config.id,
            name: self.config.name().to_string(),
            resolution: format!("{}x{}", self.config.width, self.config.height),
            fps: self.config.fps,
            codec: self.config.codec.name().to_string(),
            shm_path: self.shm_path.clone(),
            websocket_path: format!("/?{}={}", SELECTOR_PARAM, self.config.id.index()),
            active: self.is_active(),
        }
    }

    pub async fn stats(&self) -> ChannelStats {
        let mut stats = ChannelStats::new(self.config.id);
        stats.active = self.is_active();
        stats.frames_in = self.counters.frames();
        stats.keyframes = self.counters.keyframes();
        stats.bytes_in = self.counters.bytes();
        stats.bitrate = self.counters.bitrate();
        stats.framerate = self.counters.framerate();
        stats.ring_oversized = self.counters.oversized();

        if let Some(producer) = self.lock_producer().as_ref() {
            let header = producer.header();
            stats.ring_frames = header.frame_count;
            stats.ring_dropped = header.dropped_frames;
            stats.ring_readers = header.active_reader_count;
        }

        stats.queue_len = self.queue.len();
        stats.queue_dropped = self.queue.dropped();
        stats.connections = self.registry.connection_count().await;
        stats.frames_dispatched = self.registry.frames_dispatched();
        stats.evictions = self.registry.evictions();
        stats
    }

    /// Stop accepting frames and destroy the ring
    pub fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(producer) = self.lock_producer().take() {
            producer.destroy();
        }
        self.queue.clear();
        tracing::info!(channel = %self.config.id, "Channel deactivated");
    }

    fn lock_producer(&self) -> MutexGuard<'_, Option<ProducerHandle>> {
        self.producer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The channels of one device
#[derive(Debug, Default)]
pub struct ChannelSet {
    channels: Vec<Arc<ChannelContext>>,
}

impl ChannelSet {
    /// Open every enabled channel
    ///
    /// A channel whose segment cannot be created is logged and left out;
    /// the others continue.
    pub fn open(configs: &[ChannelConfig], shm: &ShmConfig, fanout: &FanoutConfig) -> Self {
        let mut channels = Vec::new();

        for config in configs.iter().filter(|c| c.enabled) {
            if channels
                .iter()
                .any(|c: &Arc<ChannelContext>| c.id() == config.id)
            {
                tracing::warn!(channel = %config.id, "Duplicate channel configuration ignored");
                continue;
            }

            match ChannelContext::open(config.clone(), shm, fanout) {
                Ok(context) => channels.push(Arc::new(context)),
                Err(e) => {
                    tracing::error!(channel = %config.id, error = %e, "Channel failed to initialize, marked inactive");
                }
            }
        }

        channels.sort_by_key(|c| c.id());
        Self { channels }
    }

    pub fn get(&self, id: ChannelId) -> Option<&Arc<ChannelContext>> {
        self.channels.iter().find(|c| c.id() == id)
    }

    /// Channels currently accepting frames
    pub fn active(&self) -> impl Iterator<Item = &Arc<ChannelContext>> {
        self.channels.iter().filter(|c| c.is_active())
    }

    pub fn is_empty(&self) -> bool {
        self.active().next().is_none()
    }

    /// Discovery records of active channels only
    pub fn discovery(&self) -> Vec<ChannelInfo> {
        self.active().map(|c| c.info()).collect()
    }

    /// Router over the active channels
    pub fn router(&self) -> ChannelRouter {
        self.active()
            .fold(ChannelRouter::new(), |router, c| router.with_channel(Arc::clone(c.registry())))
    }

    /// Start one dispatch task per active channel
    pub fn spawn_dispatch(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.active()
            .map(|c| c.registry().spawn_dispatch(shutdown.clone()))
            .collect()
    }

    pub async fn stats(&self) -> Vec<ChannelStats> {
        let mut stats = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            stats.push(channel.stats().await);
        }
        stats
    }

    /// Deactivate every channel, destroying their rings
    pub fn shutdown(&self) {
        for channel in &self.channels {
            channel.deactivate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Codec;
    use crate::shm::{test_config, ConsumerHandle};

    fn meta(config: &ChannelConfig) -> FrameMeta {
        FrameMeta::new(config.codec, config.width, config.height, config.fps)
    }

    #[test]
    fn test_on_frame_feeds_ring_and_queue() {
        let shm = test_config("ctx_feed");
        let config = ChannelConfig::default_for(ChannelId::Low);
        let context = ChannelContext::open(config.clone(), &shm, &FanoutConfig::default()).unwrap();
        let mut consumer = ConsumerHandle::attach(ChannelId::Low, &shm).unwrap();

        let outcome = context.on_frame(Bytes::from_static(b"idr"), meta(&config).keyframe(true));
        assert_eq!(outcome.ring, Some(WriteOutcome::Written { sequence: 0, slot: 0 }));
        assert_eq!(outcome.queue, Some(PushOutcome::Queued));

        let local = consumer.read_latest().unwrap().unwrap();
        let queued = context.queue().try_pop().unwrap();
        assert_eq!(&local.payload[..], b"idr");
        assert_eq!(queued.payload, Bytes::from_static(b"idr"));
        assert_eq!(local.meta.capture_timestamp_ms, queued.capture_timestamp_ms);
        assert!(queued.capture_timestamp_ms > 0);
    }

    #[test]
    fn test_oversized_frame_still_queued() {
        let shm = test_config("ctx_oversized");
        let config = ChannelConfig::default_for(ChannelId::High);
        let context = ChannelContext::open(config.clone(), &shm, &FanoutConfig::default()).unwrap();

        let big = Bytes::from(vec![0u8; shm.geometry().max_frame_size as usize + 1]);
        let outcome = context.on_frame(big, meta(&config));
        assert_eq!(outcome.ring, None);
        assert_eq!(outcome.queue, Some(PushOutcome::Queued));
        assert_eq!(context.queue().len(), 1);
    }

    #[test]
    fn test_deactivate_destroys_ring() {
        let shm = test_config("ctx_deactivate");
        let config = ChannelConfig::default_for(ChannelId::Medium);
        let context = ChannelContext::open(config.clone(), &shm, &FanoutConfig::default()).unwrap();
        let mut consumer = ConsumerHandle::attach(ChannelId::Medium, &shm).unwrap();

        context.deactivate();
        assert!(!context.is_active());
        assert!(matches!(consumer.read_latest(), Err(ShmError::ChannelUnavailable)));

        let outcome = context.on_frame(Bytes::from_static(b"late"), meta(&config));
        assert_eq!(outcome, FrameOutcome { ring: None, queue: None });
    }

    #[test]
    fn test_channel_set_discovery() {
        let shm = test_config("ctx_discovery");
        let configs = vec![
            ChannelConfig::default_for(ChannelId::High),
            ChannelConfig::default_for(ChannelId::Medium).disabled(),
            ChannelConfig::default_for(ChannelId::Low).codec(Codec::H265),
        ];
        let set = ChannelSet::open(&configs, &shm, &FanoutConfig::default());

        let info = set.discovery();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].id, ChannelId::High);
        assert_eq!(info[0].resolution, "1920x1080");
        assert_eq!(info[0].websocket_path, "/?channel=0");
        assert_eq!(info[0].shm_path, shm.segment_name(ChannelId::High));
        assert_eq!(info[1].codec, "H.265");
        assert!(set.get(ChannelId::Medium).is_none());

        let router = set.router();
        assert_eq!(router.active_channels(), vec![ChannelId::High, ChannelId::Low]);

        set.shutdown();
        assert!(set.discovery().is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn test_failed_channel_left_out() {
        let shm = test_config("ctx_fail");
        let mut broken = shm.clone();
        broken.segment_prefix = "/bad\0name".into();

        let ok = ChannelContext::open(ChannelConfig::default_for(ChannelId::High), &shm, &FanoutConfig::default());
        assert!(ok.is_ok());

        let set = ChannelSet::open(&ChannelConfig::defaults(), &broken, &FanoutConfig::default());
        assert!(set.is_empty());
        assert!(set.discovery().is_empty());
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let shm = test_config("ctx_stats");
        let config = ChannelConfig::default_for(ChannelId::High);
        let context = ChannelContext::open(config.clone(), &shm, &FanoutConfig::default()).unwrap();

        for _ in 0..3 {
            context.on_frame(Bytes::from_static(b"abcd"), meta(&config));
        }

        let stats = context.stats().await;
        assert!(stats.active);
        assert_eq!(stats.frames_in, 3);
        assert_eq!(stats.bytes_in, 12);
        assert_eq!(stats.ring_frames, 3);
        assert_eq!(stats.queue_len, 3);
        assert_eq!(stats.connections, 0);
    }
}
