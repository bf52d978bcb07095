//! Per-channel connection registry and dispatch loop

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::config::FanoutConfig;
use super::connection::{CloseReason, ConnectionEntry, ConnectionStats, Delivery};
use super::packet::WirePacket;
use super::queue::{ChannelQueue, QueuedFrame};
use crate::channel::ChannelId;

/// Live connections of one channel
///
/// The connection set is guarded separately from the channel's queue, so
/// the encoder callback never contends with subscribe/unsubscribe.
pub struct ConnectionRegistry {
    channel: ChannelId,
    queue: Arc<ChannelQueue>,
    connections: RwLock<HashMap<u64, Arc<ConnectionEntry>>>,
    config: FanoutConfig,
    frames_dispatched: AtomicU64,
    evictions: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(channel: ChannelId, queue: Arc<ChannelQueue>, config: FanoutConfig) -> Self {
        Self {
            channel,
            queue,
            connections: RwLock::new(HashMap::new()),
            config,
            frames_dispatched: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn queue(&self) -> &Arc<ChannelQueue> {
        &self.queue
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Start delivering this channel's frames to `entry`
    pub async fn add(&self, entry: Arc<ConnectionEntry>) {
        let mut connections = self.connections.write().await;
        let id = entry.id();
        connections.insert(id, entry);

        tracing::info!(
            channel = %self.channel,
            connection_id = id,
            connections = connections.len(),
            "Connection subscribed"
        );
    }

    /// Remove a connection and close its transport
    ///
    /// Returns false if it was already gone. The connection stops receiving
    /// frames as soon as it is out of the map.
    pub async fn remove(&self, id: u64, reason: CloseReason) -> bool {
        let Some(entry) = self.take(id, reason).await else {
            return false;
        };
        entry.close_sink(self.config.write_deadline).await;
        true
    }

    /// Unmap a connection and record why; the transport is left open
    async fn take(&self, id: u64, reason: CloseReason) -> Option<Arc<ConnectionEntry>> {
        let (entry, remaining) = {
            let mut connections = self.connections.write().await;
            let entry = connections.remove(&id);
            (entry, connections.len())
        };
        let entry = entry?;

        entry.mark_closed(reason);

        let stats = entry.stats();
        tracing::info!(
            channel = %self.channel,
            connection_id = id,
            reason = ?reason,
            delivered = stats.delivered,
            stalls = stats.stalls,
            connections = remaining,
            "Connection removed"
        );
        Some(entry)
    }

    pub async fn contains(&self, id: u64) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_stats(&self) -> Vec<ConnectionStats> {
        let connections = self.connections.read().await;
        let mut stats: Vec<_> = connections.values().map(|c| c.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Frames taken off the queue and offered to subscribers
    pub fn frames_dispatched(&self) -> u64 {
        self.frames_dispatched.load(Ordering::Relaxed)
    }

    /// Connections removed for failing or stalling
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Write one frame to every current subscriber
    ///
    /// The packet is encoded once and shared. Connections are written
    /// concurrently, each bounded by the write deadline; a failing or
    /// repeatedly stalling connection is removed without touching the
    /// others. Returns the number of successful deliveries.
    pub async fn dispatch_once(&self, frame: QueuedFrame) -> usize {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<Arc<ConnectionEntry>> =
            self.connections.read().await.values().cloned().collect();
        if targets.is_empty() {
            return 0;
        }

        let packet = WirePacket::new(self.channel, frame.payload, frame.capture_timestamp_ms).encode();
        let deadline = self.config.write_deadline;

        let results = join_all(targets.iter().map(|entry| {
            let packet = packet.clone();
            async move { (entry.id(), entry.deliver(packet, deadline).await) }
        }))
        .await;

        let mut delivered = 0;
        for (id, result) in results {
            match result {
                Delivery::Delivered => delivered += 1,
                Delivery::Stalled(misses) => {
                    tracing::debug!(channel = %self.channel, connection_id = id, misses, "Write deadline missed");
                    if misses >= self.config.stall_limit {
                        tracing::warn!(channel = %self.channel, connection_id = id, misses, "Evicting stalled connection");
                        self.evict(id, CloseReason::Stalled).await;
                    }
                }
                Delivery::Failed(e) => {
                    tracing::debug!(channel = %self.channel, connection_id = id, error = %e, "Write failed");
                    self.evict(id, CloseReason::WriteFailed).await;
                }
            }
        }

        tracing::trace!(
            channel = %self.channel,
            timestamp = frame.capture_timestamp_ms,
            delivered,
            "Frame dispatched"
        );
        delivered
    }

    /// Remove a connection from inside the dispatch loop
    ///
    /// Closing a stalled transport can take another full deadline, so it
    /// runs on its own task.
    async fn evict(&self, id: u64, reason: CloseReason) {
        let Some(entry) = self.take(id, reason).await else {
            return;
        };
        self.evictions.fetch_add(1, Ordering::Relaxed);

        let deadline = self.config.write_deadline;
        tokio::spawn(async move {
            entry.close_sink(deadline).await;
        });
    }

    /// Drain the queue until shutdown, then close every connection
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(channel = %self.channel, "Dispatch loop started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                frame = self.queue.pop() => {
                    self.dispatch_once(frame).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.close_all(CloseReason::Shutdown).await;
        tracing::debug!(
            channel = %self.channel,
            frames = self.frames_dispatched(),
            "Dispatch loop stopped"
        );
    }

    /// Spawn the dispatch loop for this channel
    pub fn spawn_dispatch(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }

    /// Remove every connection
    pub async fn close_all(&self, reason: CloseReason) {
        let ids: Vec<u64> = self.connections.read().await.keys().copied().collect();
        for id in ids {
            self.remove(id, reason).await;
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("channel", &self.channel)
            .field("config", &self.config)
            .finish()
    }
}
