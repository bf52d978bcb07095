//! Producer side of a channel ring
//!
//! One producer per channel, living on the encoder thread. Writes never
//! block: if the write-exclusion semaphore is busy the frame is counted as
//! dropped and the call still succeeds.

use std::sync::atomic::Ordering;

use super::config::ShmConfig;
use super::layout::{
    Geometry, RingHeader, MAGIC, OFF_ACTIVE_READERS, OFF_DROPPED_FRAMES, OFF_FRAME_COUNT,
    OFF_MAGIC, OFF_MAX_FRAME_SIZE, OFF_PRODUCER_PID, OFF_RING_SIZE, OFF_VERSION,
    OFF_WRITE_INDEX, VERSION,
};
use super::segment::SharedSegment;
use super::sem::NamedSemaphore;
use crate::channel::ChannelId;
use crate::error::ShmError;
use crate::frame::{now_ms, FrameMeta};

/// Result of a successful `write`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Frame stored in `slot` with the stamped `sequence`
    Written { sequence: u32, slot: u32 },
    /// Write lock was busy; frame counted in `dropped_frames`
    Dropped,
}

/// Exclusive writer of one channel's ring
#[derive(Debug)]
pub struct ProducerHandle {
    channel: ChannelId,
    geometry: Geometry,
    segment: SharedSegment,
    write_lock: NamedSemaphore,
    notify: NamedSemaphore,
    sequence: u32,
    destroyed: bool,
}

impl ProducerHandle {
    /// Create the channel's segment and semaphores, clearing stale ones
    pub fn attach(channel: ChannelId, config: &ShmConfig) -> Result<Self, ShmError> {
        let geometry = config.geometry();
        let segment_name = config.segment_name(channel);

        let segment = SharedSegment::create(&segment_name, geometry.segment_len())?;
        segment.clear();

        let write_lock = match NamedSemaphore::create(&config.write_lock_name(channel), 1) {
            Ok(sem) => sem,
            Err(e) => {
                SharedSegment::unlink(&segment_name);
                return Err(e);
            }
        };
        let notify = match NamedSemaphore::create(&config.notify_name(channel), 0) {
            Ok(sem) => sem,
            Err(e) => {
                NamedSemaphore::unlink(write_lock.name());
                SharedSegment::unlink(&segment_name);
                return Err(e);
            }
        };

        segment.word(OFF_VERSION).store(VERSION, Ordering::Relaxed);
        segment.word(OFF_RING_SIZE).store(geometry.ring_size, Ordering::Relaxed);
        segment
            .word(OFF_MAX_FRAME_SIZE)
            .store(geometry.max_frame_size, Ordering::Relaxed);
        segment
            .word(OFF_PRODUCER_PID)
            .store(std::process::id(), Ordering::Relaxed);
        // Magic last: a consumer that sees it sees a complete header
        segment.word(OFF_MAGIC).store(MAGIC, Ordering::Release);

        tracing::info!(
            channel = %channel,
            segment = %segment_name,
            segment_bytes = geometry.segment_len(),
            ring_size = geometry.ring_size,
            max_frame_size = geometry.max_frame_size,
            "Producer attached"
        );

        Ok(Self {
            channel,
            geometry,
            segment,
            write_lock,
            notify,
            sequence: 0,
            destroyed: false,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Publish one frame
    ///
    /// The sequence number is always stamped from this producer's counter;
    /// the timestamp is stamped only when `meta.capture_timestamp_ms` is 0.
    pub fn write(&mut self, payload: &[u8], meta: &FrameMeta) -> Result<WriteOutcome, ShmError> {
        let max = self.geometry.max_frame_size as usize;
        if payload.len() > max {
            return Err(ShmError::FrameTooLarge {
                size: payload.len(),
                max,
            });
        }

        if !self.write_lock.try_acquire() {
            let dropped = self
                .segment
                .word(OFF_DROPPED_FRAMES)
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            tracing::debug!(channel = %self.channel, dropped, "Frame dropped, write lock busy");
            return Ok(WriteOutcome::Dropped);
        }

        let write_index = self.segment.word(OFF_WRITE_INDEX).load(Ordering::Relaxed);
        let slot = self.geometry.slot_for(write_index);

        let mut stamped = *meta;
        stamped.sequence = self.sequence;
        stamped.payload_size = payload.len() as u32;
        if stamped.capture_timestamp_ms == 0 {
            stamped.capture_timestamp_ms = now_ms();
        }

        // Both offsets are inside the segment by construction of the geometry
        let meta_ok = self
            .segment
            .write_at(self.geometry.slot_offset(slot), &stamped.encode());
        let payload_ok = self
            .segment
            .write_at(self.geometry.payload_offset(slot), payload);
        debug_assert!(meta_ok && payload_ok);

        self.segment
            .word(OFF_WRITE_INDEX)
            .fetch_add(1, Ordering::Release);
        self.segment
            .word(OFF_FRAME_COUNT)
            .fetch_add(1, Ordering::Release);
        self.sequence = self.sequence.wrapping_add(1);

        self.write_lock.release();
        self.notify.release();

        tracing::trace!(
            channel = %self.channel,
            sequence = stamped.sequence,
            size = payload.len(),
            slot,
            keyframe = stamped.is_keyframe,
            "Frame written"
        );

        Ok(WriteOutcome::Written {
            sequence: stamped.sequence,
            slot,
        })
    }

    /// Snapshot of the header counters
    pub fn header(&self) -> RingHeader {
        RingHeader {
            magic: self.segment.word(OFF_MAGIC).load(Ordering::Acquire),
            version: self.segment.word(OFF_VERSION).load(Ordering::Relaxed),
            write_index: self.segment.word(OFF_WRITE_INDEX).load(Ordering::Acquire),
            frame_count: self.segment.word(OFF_FRAME_COUNT).load(Ordering::Acquire),
            dropped_frames: self.segment.word(OFF_DROPPED_FRAMES).load(Ordering::Relaxed),
            active_reader_count: self.segment.word(OFF_ACTIVE_READERS).load(Ordering::Relaxed)
                as i32,
        }
    }

    /// Remove the segment and semaphores system-wide
    ///
    /// Consumers still mapping the segment see `ChannelUnavailable` on
    /// their next read or wait.
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let header = self.header();
        self.segment.word(OFF_MAGIC).store(0, Ordering::Release);

        // Wake blocked consumers so they notice promptly
        for _ in 0..header.active_reader_count.max(0) {
            self.notify.release();
        }

        NamedSemaphore::unlink(self.notify.name());
        NamedSemaphore::unlink(self.write_lock.name());
        SharedSegment::unlink(self.segment.name());

        tracing::info!(
            channel = %self.channel,
            total_frames = header.frame_count,
            dropped = header.dropped_frames,
            readers = header.active_reader_count,
            "Producer destroyed"
        );
    }

    #[cfg(test)]
    pub(crate) fn hold_write_lock(&self) -> bool {
        self.write_lock.try_acquire()
    }

    #[cfg(test)]
    pub(crate) fn release_write_lock(&self) {
        self.write_lock.release();
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Codec;
    use crate::shm::test_config;

    fn meta() -> FrameMeta {
        FrameMeta::new(Codec::H264, 640, 480, 15)
    }

    #[test]
    fn test_write_stamps_sequence_and_counters() {
        let config = test_config("prod_seq");
        let mut producer = ProducerHandle::attach(ChannelId::High, &config).unwrap();

        for expected in 0..5u32 {
            let outcome = producer.write(b"frame", &meta()).unwrap();
            assert_eq!(
                outcome,
                WriteOutcome::Written {
                    sequence: expected,
                    slot: expected % config.ring_size,
                }
            );
        }

        let header = producer.header();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.write_index, 5);
        assert_eq!(header.frame_count, 5);
        assert_eq!(header.dropped_frames, 0);
    }

    #[test]
    fn test_max_frame_size_boundary() {
        let config = test_config("prod_max");
        let max = config.geometry().max_frame_size as usize;
        let mut producer = ProducerHandle::attach(ChannelId::High, &config).unwrap();

        let exact = vec![0xAB; max];
        assert!(matches!(
            producer.write(&exact, &meta()),
            Ok(WriteOutcome::Written { .. })
        ));

        let too_big = vec![0xAB; max + 1];
        let err = producer.write(&too_big, &meta()).unwrap_err();
        assert!(matches!(err, ShmError::FrameTooLarge { size, max: m } if size == max + 1 && m == max));

        let header = producer.header();
        assert_eq!(header.write_index, 1);
        assert_eq!(header.frame_count, 1);
    }

    #[test]
    fn test_contention_drops_without_blocking() {
        let config = test_config("prod_contend");
        let mut producer = ProducerHandle::attach(ChannelId::Medium, &config).unwrap();

        producer.write(b"a", &meta()).unwrap();
        assert!(producer.hold_write_lock());

        assert_eq!(producer.write(b"b", &meta()).unwrap(), WriteOutcome::Dropped);
        assert_eq!(producer.write(b"c", &meta()).unwrap(), WriteOutcome::Dropped);

        producer.release_write_lock();
        assert!(matches!(
            producer.write(b"d", &meta()).unwrap(),
            WriteOutcome::Written { sequence: 1, .. }
        ));

        let header = producer.header();
        assert_eq!(header.dropped_frames, 2);
        assert_eq!(header.frame_count, 2);
    }

    #[test]
    fn test_no_readers_never_drops() {
        let config = test_config("prod_noreaders");
        let mut producer = ProducerHandle::attach(ChannelId::Low, &config).unwrap();

        for _ in 0..(config.ring_size * 3) {
            producer.write(b"payload", &meta()).unwrap();
        }

        let header = producer.header();
        assert_eq!(header.dropped_frames, 0);
        assert_eq!(header.active_reader_count, 0);
        assert_eq!(header.frame_count, config.ring_size * 3);
    }

    #[test]
    fn test_destroy_unlinks_names() {
        let config = test_config("prod_destroy");
        let producer = ProducerHandle::attach(ChannelId::High, &config).unwrap();
        producer.destroy();

        assert!(SharedSegment::open(&config.segment_name(ChannelId::High))
            .unwrap_err()
            .is_retryable());
        assert!(NamedSemaphore::open(&config.notify_name(ChannelId::High))
            .unwrap_err()
            .is_retryable());
    }
}
