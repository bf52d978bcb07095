//! Encoded frame metadata
//!
//! `FrameMeta` travels with every encoded picture from the encoder callback
//! into the shared ring. Inside a slot it is stored as a fixed 32-byte
//! little-endian record:
//!
//! ```text
//! +0  timestamp_ms u64
//! +8  size         u32
//! +12 sequence     u32
//! +16 is_keyframe  u8
//! +17 codec        u8   (0=H.264, 1=H.265, 2=JPEG)
//! +18 width        u16
//! +20 height       u16
//! +22 fps          u8
//! +23 reserved     (9 bytes, zero)
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes};
use serde::Serialize;

/// Size of an encoded `FrameMeta` record
pub const META_SIZE: usize = 32;

/// Video codec of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Codec {
    #[default]
    H264 = 0,
    H265 = 1,
    Jpeg = 2,
}

impl Codec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Codec::H264),
            1 => Some(Codec::H265),
            2 => Some(Codec::Jpeg),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::H264 => "H.264",
            Codec::H265 => "H.265",
            Codec::Jpeg => "JPEG",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata for one encoded picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMeta {
    /// Capture time in milliseconds (0 = let the producer stamp it)
    pub capture_timestamp_ms: u64,
    /// Payload length in bytes
    pub payload_size: u32,
    /// Monotonic per-producer sequence number
    pub sequence: u32,
    /// I-frame / IDR
    pub is_keyframe: bool,
    pub codec: Codec,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
}

impl FrameMeta {
    /// Create metadata for a stream with the given format
    pub fn new(codec: Codec, width: u16, height: u16, fps: u8) -> Self {
        Self {
            codec,
            width,
            height,
            fps,
            ..Default::default()
        }
    }

    /// Set the keyframe flag
    pub fn keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    /// Set the capture timestamp
    pub fn timestamp(mut self, ms: u64) -> Self {
        self.capture_timestamp_ms = ms;
        self
    }

    /// Pack into a 32-byte record
    pub fn encode(&self) -> [u8; META_SIZE] {
        let mut out = [0u8; META_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.capture_timestamp_ms);
        buf.put_u32_le(self.payload_size);
        buf.put_u32_le(self.sequence);
        buf.put_u8(self.is_keyframe as u8);
        buf.put_u8(self.codec.as_byte());
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_u8(self.fps);
        out
    }

    /// Unpack a 32-byte record
    ///
    /// Returns `None` if the record is short or names an unknown codec,
    /// which for a shared slot means it was overwritten while being read.
    pub fn decode(record: &[u8]) -> Option<Self> {
        if record.len() < META_SIZE {
            return None;
        }

        let mut buf = &record[..META_SIZE];
        let capture_timestamp_ms = buf.get_u64_le();
        let payload_size = buf.get_u32_le();
        let sequence = buf.get_u32_le();
        let is_keyframe = buf.get_u8() != 0;
        let codec = Codec::from_byte(buf.get_u8())?;
        let width = buf.get_u16_le();
        let height = buf.get_u16_le();
        let fps = buf.get_u8();

        Some(Self {
            capture_timestamp_ms,
            payload_size,
            sequence,
            is_keyframe,
            codec,
            width,
            height,
            fps,
        })
    }
}

/// A frame read from the shared ring
#[derive(Debug, Clone)]
pub struct LatestFrame {
    pub meta: FrameMeta,
    pub payload: Bytes,
    /// Frames the producer completed since this consumer's previous read
    /// that were never observed. Informational only.
    pub missed: u32,
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_from_byte() {
        assert_eq!(Codec::from_byte(0), Some(Codec::H264));
        assert_eq!(Codec::from_byte(1), Some(Codec::H265));
        assert_eq!(Codec::from_byte(2), Some(Codec::Jpeg));
        assert_eq!(Codec::from_byte(3), None);
    }

    #[test]
    fn test_meta_layout() {
        let meta = FrameMeta {
            capture_timestamp_ms: 0x0102_0304_0506_0708,
            payload_size: 1000,
            sequence: 7,
            is_keyframe: true,
            codec: Codec::H265,
            width: 1920,
            height: 1080,
            fps: 30,
        };

        let record = meta.encode();
        assert_eq!(&record[0..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&record[8..12], &1000u32.to_le_bytes());
        assert_eq!(&record[12..16], &7u32.to_le_bytes());
        assert_eq!(record[16], 1);
        assert_eq!(record[17], 1);
        assert_eq!(&record[18..20], &1920u16.to_le_bytes());
        assert_eq!(&record[20..22], &1080u16.to_le_bytes());
        assert_eq!(record[22], 30);
        assert!(record[23..].iter().all(|&b| b == 0));

        assert_eq!(FrameMeta::decode(&record), Some(meta));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut record = FrameMeta::default().encode();
        record[17] = 0xEE;
        assert!(FrameMeta::decode(&record).is_none());
        assert!(FrameMeta::decode(&record[..10]).is_none());
    }

    #[test]
    fn test_builder() {
        let meta = FrameMeta::new(Codec::H264, 640, 480, 15)
            .keyframe(true)
            .timestamp(42);
        assert!(meta.is_keyframe);
        assert_eq!(meta.capture_timestamp_ms, 42);
        assert_eq!(meta.width, 640);
        assert_eq!(meta.fps, 15);
    }
}
