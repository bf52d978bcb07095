//! Consumer side of a channel ring
//!
//! Consumers never create anything. They start at the frame count observed
//! on attach (no history replay) and always read the most recently
//! completed slot: a consumer that falls behind skips straight to the newest
//! frame and is told how many it missed.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use super::config::ShmConfig;
use super::layout::{
    Geometry, RingHeader, MAGIC, OFF_ACTIVE_READERS, OFF_DROPPED_FRAMES, OFF_FRAME_COUNT,
    OFF_MAGIC, OFF_MAX_FRAME_SIZE, OFF_PRODUCER_PID, OFF_RING_SIZE, OFF_VERSION,
    OFF_WRITE_INDEX,
};
use super::segment::SharedSegment;
use super::sem::NamedSemaphore;
use crate::channel::ChannelId;
use crate::error::ShmError;
use crate::frame::{FrameMeta, LatestFrame, META_SIZE};

/// Counters reported by `ConsumerHandle::stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Frames the producer has completed
    pub frame_count: u32,
    /// Frames the producer dropped on write-lock contention
    pub dropped_frames: u32,
    /// Frames this consumer skipped across all its reads
    pub missed_frames: u64,
    /// Frames completed since this consumer's last read
    pub pending_frames: u32,
    /// Consumers currently attached, across all processes
    pub active_readers: i32,
}

/// Reader of one channel's ring
#[derive(Debug)]
pub struct ConsumerHandle {
    channel: ChannelId,
    geometry: Geometry,
    segment: SharedSegment,
    _write_lock: NamedSemaphore,
    notify: NamedSemaphore,
    watermark: u32,
    missed_total: u64,
    reader_id: u32,
    wait_slice: Duration,
    detached: bool,
}

impl ConsumerHandle {
    /// Open an existing channel ring
    ///
    /// Fails with `NotFound` when no producer has attached yet, and with
    /// `IncompatibleFormat` when the segment is not exactly this format.
    pub fn attach(channel: ChannelId, config: &ShmConfig) -> Result<Self, ShmError> {
        let segment = SharedSegment::open(&config.segment_name(channel))?;

        let magic = segment.word(OFF_MAGIC).load(Ordering::Acquire);
        let version = segment.word(OFF_VERSION).load(Ordering::Relaxed);
        if magic == 0 {
            // Producer is still initializing, or already destroyed
            return Err(ShmError::NotFound {
                name: segment.name().to_string(),
            });
        }
        let header = snapshot(&segment);
        if let Err(e) = header.validate() {
            tracing::error!(
                channel = %channel,
                magic = format_args!("{:#010x}", magic),
                version,
                "Refusing incompatible segment"
            );
            return Err(e);
        }

        let geometry = Geometry::from_header(
            segment.word(OFF_RING_SIZE).load(Ordering::Relaxed),
            segment.word(OFF_MAX_FRAME_SIZE).load(Ordering::Relaxed),
        )?;
        if segment.len() < geometry.segment_len() {
            return Err(ShmError::IncompatibleFormat { magic, version });
        }

        let write_lock = NamedSemaphore::open(&config.write_lock_name(channel))?;
        let notify = NamedSemaphore::open(&config.notify_name(channel))?;

        let watermark = segment.word(OFF_FRAME_COUNT).load(Ordering::Acquire);
        segment.word(OFF_ACTIVE_READERS).fetch_add(1, Ordering::AcqRel);
        let reader_id = std::process::id();

        tracing::info!(
            channel = %channel,
            reader_id,
            starting_count = watermark,
            "Consumer attached"
        );

        Ok(Self {
            channel,
            geometry,
            segment,
            _write_lock: write_lock,
            notify,
            watermark,
            missed_total: 0,
            reader_id,
            wait_slice: config.wait_slice,
            detached: false,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn reader_id(&self) -> u32 {
        self.reader_id
    }

    /// Frames observed so far, as a producer frame count
    pub fn watermark(&self) -> u32 {
        self.watermark
    }

    /// Copy out the most recently completed frame, if there is a new one
    pub fn read_latest(&mut self) -> Result<Option<LatestFrame>, ShmError> {
        self.ensure_available()?;

        let current = self.segment.word(OFF_FRAME_COUNT).load(Ordering::Acquire);
        if current == self.watermark {
            return Ok(None);
        }

        let write_index = self.segment.word(OFF_WRITE_INDEX).load(Ordering::Acquire);
        let slot = self.geometry.latest_slot(write_index);

        let missed = current.wrapping_sub(self.watermark).wrapping_sub(1);
        self.watermark = current;
        self.missed_total += u64::from(missed);
        if missed > 0 {
            tracing::debug!(channel = %self.channel, reader_id = self.reader_id, missed, "Consumer missed frames");
        }

        let mut record = [0u8; META_SIZE];
        self.segment
            .read_at(self.geometry.slot_offset(slot), &mut record);
        let meta = FrameMeta::decode(&record).ok_or(ShmError::CorruptSlot {
            index: slot,
            size: u32::from_le_bytes([record[8], record[9], record[10], record[11]]),
        })?;

        if meta.payload_size > self.geometry.max_frame_size {
            return Err(ShmError::CorruptSlot {
                index: slot,
                size: meta.payload_size,
            });
        }

        let mut payload = BytesMut::zeroed(meta.payload_size as usize);
        self.segment
            .read_at(self.geometry.payload_offset(slot), &mut payload);

        tracing::trace!(
            channel = %self.channel,
            sequence = meta.sequence,
            size = meta.payload_size,
            slot,
            "Frame read"
        );

        Ok(Some(LatestFrame {
            meta,
            payload: payload.freeze(),
            missed,
        }))
    }

    /// Block until the producer signals a new frame, then `read_latest`
    ///
    /// `None` waits indefinitely, but internally blocks at most
    /// `wait_slice` at a time so a destroyed producer surfaces as
    /// `ChannelUnavailable` instead of a hang. `Ok(None)` only once the
    /// timeout has elapsed with no new frame.
    pub fn wait_and_read(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<LatestFrame>, ShmError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.ensure_available()?;

            // The frame count is the source of truth. Permits are shared
            // between consumers and pile up while nobody reads, so a permit
            // alone is not a new frame.
            if self.has_new_frame() {
                return self.read_latest();
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(self.wait_slice)
                }
                None => self.wait_slice,
            };

            self.notify
                .wait_timeout(slice)
                .map_err(|e| ShmError::segment(self.notify.name(), e))?;
        }
    }

    /// Whether the producer has completed a frame since the last read
    pub fn has_new_frame(&self) -> bool {
        self.segment.word(OFF_FRAME_COUNT).load(Ordering::Acquire) != self.watermark
    }

    pub fn stats(&self) -> ConsumerStats {
        let header = snapshot(&self.segment);
        ConsumerStats {
            frame_count: header.frame_count,
            dropped_frames: header.dropped_frames,
            missed_frames: self.missed_total,
            pending_frames: header.frame_count.wrapping_sub(self.watermark),
            active_readers: header.active_reader_count,
        }
    }

    /// Release this consumer. The segment itself is left alone.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.segment
            .word(OFF_ACTIVE_READERS)
            .fetch_sub(1, Ordering::AcqRel);

        tracing::info!(
            channel = %self.channel,
            reader_id = self.reader_id,
            last_count = self.watermark,
            missed = self.missed_total,
            "Consumer detached"
        );
    }

    fn ensure_available(&self) -> Result<(), ShmError> {
        if self.segment.word(OFF_MAGIC).load(Ordering::Acquire) != MAGIC {
            return Err(ShmError::ChannelUnavailable);
        }

        let pid = self.segment.word(OFF_PRODUCER_PID).load(Ordering::Relaxed);
        if pid != 0 && !process_alive(pid) {
            return Err(ShmError::ChannelUnavailable);
        }
        Ok(())
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn snapshot(segment: &SharedSegment) -> RingHeader {
    RingHeader {
        magic: segment.word(OFF_MAGIC).load(Ordering::Acquire),
        version: segment.word(OFF_VERSION).load(Ordering::Relaxed),
        write_index: segment.word(OFF_WRITE_INDEX).load(Ordering::Acquire),
        frame_count: segment.word(OFF_FRAME_COUNT).load(Ordering::Acquire),
        dropped_frames: segment.word(OFF_DROPPED_FRAMES).load(Ordering::Relaxed),
        active_reader_count: segment.word(OFF_ACTIVE_READERS).load(Ordering::Relaxed) as i32,
    }
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs the permission/existence check only
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
