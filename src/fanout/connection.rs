//! One subscribed network connection
//!
//! A `ConnectionEntry` wraps the transport behind the `FrameSink` trait and
//! serializes writes to it. Delivery is always bounded by a deadline so a
//! stalled peer only ever costs the dispatcher that long.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::{watch, Mutex};

use crate::channel::ChannelId;

/// Transport a connection's packets are written to
pub trait FrameSink: Send {
    /// Write one encoded wire packet
    fn send_packet(&mut self, packet: Bytes) -> BoxFuture<'_, io::Result<()>>;

    /// Close the transport. Errors are irrelevant at this point.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Why a connection left its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed or the reader side ended
    ClientClosed,
    /// A write returned an error
    WriteFailed,
    /// Too many consecutive missed write deadlines
    Stalled,
    /// Process shutdown
    Shutdown,
}

/// Result of one bounded write
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    /// Deadline missed; holds the consecutive miss count
    Stalled(u32),
    Failed(io::Error),
}

/// Snapshot of a connection's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub id: u64,
    pub channel: ChannelId,
    pub label: String,
    pub delivered: u64,
    pub attempts: u64,
    pub stalls: u64,
    pub bytes_sent: u64,
    pub connected_for: Duration,
}

pub struct ConnectionEntry {
    id: u64,
    channel: ChannelId,
    label: String,
    sink: Mutex<Box<dyn FrameSink>>,
    delivered: AtomicU64,
    attempts: AtomicU64,
    stalls: AtomicU64,
    consecutive_stalls: AtomicU32,
    bytes_sent: AtomicU64,
    connected_at: Instant,
    closed: watch::Sender<Option<CloseReason>>,
}

impl ConnectionEntry {
    pub fn new(id: u64, channel: ChannelId, label: impl Into<String>, sink: Box<dyn FrameSink>) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            id,
            channel,
            label: label.into(),
            sink: Mutex::new(sink),
            delivered: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            consecutive_stalls: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            connected_at: Instant::now(),
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write one packet, giving up after `deadline`
    pub async fn deliver(&self, packet: Bytes, deadline: Duration) -> Delivery {
        let len = packet.len() as u64;
        let mut sink = self.sink.lock().await;
        self.attempts.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(deadline, sink.send_packet(packet)).await {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(len, Ordering::Relaxed);
                self.consecutive_stalls.store(0, Ordering::Relaxed);
                Delivery::Delivered
            }
            Ok(Err(e)) => Delivery::Failed(e),
            Err(_) => {
                self.stalls.fetch_add(1, Ordering::Relaxed);
                let misses = self.consecutive_stalls.fetch_add(1, Ordering::Relaxed) + 1;
                Delivery::Stalled(misses)
            }
        }
    }

    /// Close the transport, waiting at most `deadline` for it
    pub(crate) async fn close_sink(&self, deadline: Duration) {
        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await;
        };
        if tokio::time::timeout(deadline, close).await.is_err() {
            tracing::debug!(connection_id = self.id, "Transport close timed out");
        }
    }

    /// Record why the connection ended and wake anyone waiting on it
    pub(crate) fn mark_closed(&self, reason: CloseReason) {
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.borrow()
    }

    /// Resolves once the connection has left its registry
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            // The sender lives in `self`, so this cannot fail while borrowed
            if rx.changed().await.is_err() {
                return CloseReason::Shutdown;
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            channel: self.channel,
            label: self.label.clone(),
            delivered: self.delivered.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connected_for: self.connected_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("label", &self.label)
            .finish()
    }
}
