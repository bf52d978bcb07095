//! Shared-memory frame rings
//!
//! One ring per channel, shared across processes. The producer (encoder
//! side) writes into a fixed ring of slots and posts a counting semaphore;
//! any number of consumers, in any process, attach and read the latest
//! completed frame.
//!
//! Names for channel `n` (default configuration):
//!
//! - segment: `/video_stream_ch{n}`
//! - write-exclusion semaphore: `/video_sem_write_ch{n}`
//! - read-notification semaphore: `/video_sem_read_ch{n}`

pub mod config;
pub mod consumer;
pub mod layout;
pub mod producer;

mod segment;
mod sem;

pub use config::ShmConfig;
pub use consumer::{ConsumerHandle, ConsumerStats};
pub use layout::{Geometry, RingHeader, DEFAULT_MAX_FRAME_SIZE, DEFAULT_RING_SIZE, MAGIC, VERSION};
pub use producer::{ProducerHandle, WriteOutcome};

/// Small isolated rings so parallel tests never share names
#[cfg(test)]
pub(crate) fn test_config(tag: &str) -> ShmConfig {
    ShmConfig::default()
        .namespace(&format!("camstream_{}_{}", tag, std::process::id()))
        .ring_size(4)
        .max_frame_size(1024)
        .wait_slice(std::time::Duration::from_millis(10))
}
