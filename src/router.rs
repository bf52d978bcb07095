//! Channel selection for network clients
//!
//! Every connection goes through `Connecting → Subscribed → Closed`:
//!
//! - **Connecting**: the request must carry a `channel` selector naming an
//!   active channel, otherwise the handshake is rejected and no frame is
//!   ever sent.
//! - **Subscribed**: the connection is in exactly one channel's registry
//!   for its whole lifetime.
//! - **Closed**: removed from the registry. There is no channel switch; a
//!   client that wants another channel opens another connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::ChannelId;
use crate::error::HandshakeError;
use crate::fanout::{CloseReason, ConnectionEntry, ConnectionRegistry, FrameSink};

/// Query parameter carrying the channel selector
pub const SELECTOR_PARAM: &str = "channel";

/// Lifecycle of a routed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Subscribed,
    Closed,
}

/// Extract the raw channel selector from a request query string
///
/// Returns `None` when the parameter is absent. The first occurrence wins.
pub fn selector_from_query(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == SELECTOR_PARAM)
        .map(|(_, value)| value)
}

/// Binds connections to channel registries
#[derive(Debug, Default)]
pub struct ChannelRouter {
    registries: HashMap<ChannelId, Arc<ConnectionRegistry>>,
    next_id: AtomicU64,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a channel routable
    pub fn add_channel(&mut self, registry: Arc<ConnectionRegistry>) {
        self.registries.insert(registry.channel(), registry);
    }

    pub fn with_channel(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.add_channel(registry);
        self
    }

    /// Channels a client may select, in id order
    pub fn active_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self.registries.keys().copied().collect();
        channels.sort();
        channels
    }

    pub fn registry(&self, channel: ChannelId) -> Option<&Arc<ConnectionRegistry>> {
        self.registries.get(&channel)
    }

    /// Validate the selector of a connection request
    pub fn select_channel(&self, query: Option<&str>) -> Result<ChannelId, HandshakeError> {
        let selector = selector_from_query(query).ok_or(HandshakeError::MissingSelector)?;
        let channel = ChannelId::parse_selector(selector)?;

        if !self.registries.contains_key(&channel) {
            return Err(HandshakeError::ChannelInactive(channel));
        }
        Ok(channel)
    }

    /// Allocate a connection id
    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a connection with its channel's registry
    pub async fn subscribe(
        &self,
        channel: ChannelId,
        label: impl Into<String>,
        sink: Box<dyn FrameSink>,
    ) -> Result<Subscription, HandshakeError> {
        let registry = self
            .registries
            .get(&channel)
            .ok_or(HandshakeError::ChannelInactive(channel))?;

        let id = self.next_connection_id();
        let entry = Arc::new(ConnectionEntry::new(id, channel, label, sink));
        registry.add(Arc::clone(&entry)).await;

        Ok(Subscription {
            id,
            channel,
            entry,
            registry: Arc::clone(registry),
            released: false,
        })
    }

    /// `select_channel` followed by `subscribe`
    pub async fn route(
        &self,
        query: Option<&str>,
        label: impl Into<String>,
        sink: Box<dyn FrameSink>,
    ) -> Result<Subscription, HandshakeError> {
        let channel = self.select_channel(query)?;
        self.subscribe(channel, label, sink).await
    }

    /// Close every connection on every channel
    pub async fn close_all(&self) {
        for registry in self.registries.values() {
            registry.close_all(CloseReason::Shutdown).await;
        }
    }
}

/// A connection bound to one channel
///
/// Dropping a subscription that was never closed schedules its removal on
/// the current runtime.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    channel: ChannelId,
    entry: Arc<ConnectionEntry>,
    registry: Arc<ConnectionRegistry>,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.released || self.entry.close_reason().is_some() {
            ConnectionPhase::Closed
        } else {
            ConnectionPhase::Subscribed
        }
    }

    pub fn entry(&self) -> &Arc<ConnectionEntry> {
        &self.entry
    }

    /// Resolves when the registry drops this connection (write failure,
    /// stall or shutdown)
    pub async fn closed(&self) -> CloseReason {
        self.entry.closed().await
    }

    /// Leave the channel
    pub async fn close(mut self, reason: CloseReason) {
        self.released = true;
        self.registry.remove(self.id, reason).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released || self.entry.close_reason().is_some() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = Arc::clone(&self.registry);
            let id = self.id;
            handle.spawn(async move {
                registry.remove(id, CloseReason::ClientClosed).await;
            });
        }
    }
}
