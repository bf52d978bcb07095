//! Frame sources
//!
//! A `FrameSource` stands in for the hardware encoder: it yields one
//! encoded picture at a time, and `spawn_source` feeds those pictures to a
//! channel's encoder callback on a dedicated thread at the channel's frame
//! rate.

pub mod h264;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;

use crate::channel::{ChannelConfig, ChannelContext};
use crate::frame::{Codec, FrameMeta};

pub use h264::{split_access_units, AccessUnit, NaluType};

/// Producer of encoded pictures for one channel
pub trait FrameSource: Send {
    /// Next picture, or `None` when the source is exhausted
    fn next_frame(&mut self) -> io::Result<Option<(Bytes, FrameMeta)>>;
}

/// Replays an H.264 Annex-B elementary stream, one access unit per frame
#[derive(Debug)]
pub struct AnnexBFileSource {
    units: Vec<AccessUnit>,
    position: usize,
    template: FrameMeta,
    looping: bool,
}

impl AnnexBFileSource {
    /// Load a `.h264` file for the given channel
    pub fn open(path: impl AsRef<Path>, channel: &ChannelConfig) -> io::Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let source = Self::from_bytes(Bytes::from(data), channel)?;

        tracing::info!(
            channel = %channel.id,
            path = %path.as_ref().display(),
            frames = source.len(),
            "Loaded Annex-B source"
        );
        Ok(source)
    }

    pub fn from_bytes(stream: Bytes, channel: &ChannelConfig) -> io::Result<Self> {
        if channel.codec != Codec::H264 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Annex-B source cannot feed a {} channel", channel.codec),
            ));
        }

        let units = split_access_units(&stream);
        if units.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no H.264 access units found",
            ));
        }

        Ok(Self {
            units,
            position: 0,
            template: FrameMeta::new(channel.codec, channel.width, channel.height, channel.fps),
            looping: true,
        })
    }

    /// Stop after one pass instead of looping
    pub fn once(mut self) -> Self {
        self.looping = false;
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl FrameSource for AnnexBFileSource {
    fn next_frame(&mut self) -> io::Result<Option<(Bytes, FrameMeta)>> {
        if self.position >= self.units.len() {
            if !self.looping {
                return Ok(None);
            }
            self.position = 0;
        }

        let unit = &self.units[self.position];
        self.position += 1;
        Ok(Some((unit.data.clone(), self.template.keyframe(unit.keyframe))))
    }
}

/// Drive `source` into `context` at the channel's frame rate
///
/// Runs on its own thread, like an encoder callback would. Stops when the
/// source is exhausted or fails, or when `shutdown` flips to true.
pub fn spawn_source(
    mut source: Box<dyn FrameSource>,
    context: Arc<ChannelContext>,
    shutdown: watch::Receiver<bool>,
) -> io::Result<JoinHandle<()>> {
    let channel = context.id();
    let interval = frame_interval(context.config().fps);

    std::thread::Builder::new()
        .name(format!("source-ch{}", channel))
        .spawn(move || {
            let mut next_due = Instant::now();
            let mut frames: u64 = 0;

            while !*shutdown.borrow() {
                match source.next_frame() {
                    Ok(Some((payload, meta))) => {
                        // Timestamp is stamped at hand-off
                        context.on_frame(payload, meta.timestamp(0));
                        frames += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(channel = %channel, error = %e, "Frame source failed");
                        break;
                    }
                }

                next_due += interval;
                let now = Instant::now();
                if next_due > now {
                    std::thread::sleep(next_due - now);
                } else {
                    // Running late; do not try to catch up with a burst
                    next_due = now;
                }
            }

            tracing::info!(channel = %channel, frames, "Frame source stopped");
        })
}

fn frame_interval(fps: u8) -> Duration {
    Duration::from_secs(1) / u32::from(fps.max(1))
}
