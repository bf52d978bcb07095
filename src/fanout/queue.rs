//! Bounded drop-oldest frame queue
//!
//! Sits between the encoder callback and the network dispatcher of one
//! channel. `push` is called from the encoder thread and must never block on
//! network I/O: when the queue is full the oldest frame is discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::channel::ChannelId;

/// Default queue depth: one second of 30 fps video
pub const DEFAULT_QUEUE_CAPACITY: usize = 30;

/// A frame waiting to be fanned out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame {
    pub payload: Bytes,
    pub capture_timestamp_ms: u64,
}

impl QueuedFrame {
    pub fn new(payload: Bytes, capture_timestamp_ms: u64) -> Self {
        Self {
            payload,
            capture_timestamp_ms,
        }
    }
}

/// What `push` did with the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full and its oldest frame was discarded
    ReplacedOldest,
}

/// Per-channel FIFO, shared between the encoder thread and the dispatcher
#[derive(Debug)]
pub struct ChannelQueue {
    channel: ChannelId,
    capacity: usize,
    frames: Mutex<VecDeque<QueuedFrame>>,
    pushed: AtomicU64,
    dropped: AtomicU64,
    notify: Notify,
}

impl ChannelQueue {
    /// Create a queue. A capacity of 0 is treated as 1.
    pub fn new(channel: ChannelId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            channel,
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame, discarding the oldest one if full. O(1), never waits
    /// on the consumer side.
    pub fn push(&self, frame: QueuedFrame) -> PushOutcome {
        let outcome = {
            let mut frames = self.lock();
            let outcome = if frames.len() >= self.capacity {
                frames.pop_front();
                PushOutcome::ReplacedOldest
            } else {
                PushOutcome::Queued
            };
            frames.push_back(frame);
            outcome
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if outcome == PushOutcome::ReplacedOldest {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(channel = %self.channel, dropped, "Queue full, oldest frame dropped");
        }

        self.notify.notify_one();
        outcome
    }

    /// Take the oldest frame without waiting
    pub fn try_pop(&self) -> Option<QueuedFrame> {
        self.lock().pop_front()
    }

    /// Wait for and take the oldest frame
    pub async fn pop(&self) -> QueuedFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Frames discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Discard everything queued
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedFrame>> {
        // A panic while holding the lock cannot leave the deque inconsistent
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(n: u64) -> QueuedFrame {
        QueuedFrame::new(Bytes::from(n.to_le_bytes().to_vec()), n)
    }

    #[test]
    fn test_fifo_order() {
        let queue = ChannelQueue::new(ChannelId::High, 4);
        for n in 0..3 {
            assert_eq!(queue.push(frame(n)), PushOutcome::Queued);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop().unwrap().capture_timestamp_ms, 0);
        assert_eq!(queue.try_pop().unwrap().capture_timestamp_ms, 1);
        assert_eq!(queue.try_pop().unwrap().capture_timestamp_ms, 2);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = ChannelQueue::new(ChannelId::Medium, DEFAULT_QUEUE_CAPACITY);
        for n in 0..30 {
            assert_eq!(queue.push(frame(n)), PushOutcome::Queued);
        }
        assert_eq!(queue.push(frame(30)), PushOutcome::ReplacedOldest);

        assert_eq!(queue.len(), 30);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pushed(), 31);

        let first = queue.try_pop().unwrap();
        assert_eq!(first.capture_timestamp_ms, 1);
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let queue = ChannelQueue::new(ChannelId::Low, 0);
        assert_eq!(queue.capacity(), 1);
        queue.push(frame(1));
        assert_eq!(queue.push(frame(2)), PushOutcome::ReplacedOldest);
        assert_eq!(queue.try_pop().unwrap().capture_timestamp_ms, 2);
    }

    #[test]
    fn test_clear() {
        let queue = ChannelQueue::new(ChannelId::High, 4);
        queue.push(frame(1));
        queue.push(frame(2));
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(ChannelQueue::new(ChannelId::High, 4));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        // Push from a plain thread, as the encoder callback does
        let pusher = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(frame(7)))
        };
        pusher.join().unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.capture_timestamp_ms, 7);
    }
}
