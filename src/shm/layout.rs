//! Binary layout of a channel segment
//!
//! ```text
//! +--------------------------- header (64 bytes) ---------------------------+
//! | magic | version | write_index | read_index | frame_count | dropped      |
//! | active_readers | ring_size | max_frame_size | producer_pid | reserved.. |
//! +------------------------------------------------------------------------+
//! | slot 0: FrameMeta (32) | payload (max_frame_size)                       |
//! | slot 1: ...                                                             |
//! | slot ring_size-1                                                        |
//! +------------------------------------------------------------------------+
//! ```
//!
//! Every slot has the same stride regardless of the payload it holds.
//! Header words are little-endian u32 and are only ever touched as
//! single-word atomics.

use crate::error::ShmError;
use crate::frame::META_SIZE;

/// "VIDE"
pub const MAGIC: u32 = 0x5649_4445;
pub const VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 64;

/// 30 frames @ 30fps = one second of history
pub const DEFAULT_RING_SIZE: u32 = 30;
/// 512 KiB per slot (1080p H.264)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 512 * 1024;

pub const OFF_MAGIC: usize = 0;
pub const OFF_VERSION: usize = 4;
pub const OFF_WRITE_INDEX: usize = 8;
pub const OFF_READ_INDEX: usize = 12;
pub const OFF_FRAME_COUNT: usize = 16;
pub const OFF_DROPPED_FRAMES: usize = 20;
pub const OFF_ACTIVE_READERS: usize = 24;
pub const OFF_RING_SIZE: usize = 28;
pub const OFF_MAX_FRAME_SIZE: usize = 32;
pub const OFF_PRODUCER_PID: usize = 36;

/// Slot count and capacity of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub ring_size: u32,
    pub max_frame_size: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            ring_size: DEFAULT_RING_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Geometry {
    /// Build a geometry, rounding the slot capacity up to 8 bytes so every
    /// slot's metadata stays 8-byte aligned.
    pub fn new(ring_size: u32, max_frame_size: u32) -> Self {
        Self {
            ring_size: ring_size.max(1),
            max_frame_size: max_frame_size.max(8).div_ceil(8) * 8,
        }
    }

    /// Geometry recorded in a segment header. Zero fields mean the
    /// segment was created with the default geometry.
    pub fn from_header(ring_size: u32, max_frame_size: u32) -> Result<Self, ShmError> {
        let defaults = Self::default();
        let geometry = Self {
            ring_size: if ring_size == 0 { defaults.ring_size } else { ring_size },
            max_frame_size: if max_frame_size == 0 {
                defaults.max_frame_size
            } else {
                max_frame_size
            },
        };

        if geometry.max_frame_size % 8 != 0 {
            return Err(ShmError::IncompatibleFormat {
                magic: MAGIC,
                version: VERSION,
            });
        }
        Ok(geometry)
    }

    pub fn slot_stride(&self) -> usize {
        META_SIZE + self.max_frame_size as usize
    }

    pub fn slot_offset(&self, index: u32) -> usize {
        HEADER_SIZE + (index % self.ring_size) as usize * self.slot_stride()
    }

    pub fn payload_offset(&self, index: u32) -> usize {
        self.slot_offset(index) + META_SIZE
    }

    pub fn segment_len(&self) -> usize {
        HEADER_SIZE + self.ring_size as usize * self.slot_stride()
    }

    /// Slot holding the frame written at `write_index`
    pub fn slot_for(&self, write_index: u32) -> u32 {
        write_index % self.ring_size
    }

    /// Slot holding the most recently completed frame
    pub fn latest_slot(&self, write_index: u32) -> u32 {
        write_index.wrapping_sub(1) % self.ring_size
    }
}

/// Point-in-time copy of the header counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    pub magic: u32,
    pub version: u32,
    pub write_index: u32,
    pub frame_count: u32,
    pub dropped_frames: u32,
    pub active_reader_count: i32,
}

impl RingHeader {
    /// Refuse anything that is not exactly our format
    pub fn validate(&self) -> Result<(), ShmError> {
        if self.magic != MAGIC || self.version != VERSION {
            return Err(ShmError::IncompatibleFormat {
                magic: self.magic,
                version: self.version,
            });
        }
        Ok(())
    }
}
