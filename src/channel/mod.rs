//! Video channels
//!
//! A device exposes up to three independently configured tracks. Each
//! channel owns its shared ring, its network queue and its subscriber set;
//! channels share no state.

pub mod context;

use serde::Serialize;

use crate::error::HandshakeError;
use crate::frame::Codec;

pub use context::{ChannelContext, ChannelSet};

/// Channel identifier (0 = high, 1 = medium, 2 = low resolution)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "u8")]
pub enum ChannelId {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl ChannelId {
    pub const ALL: [ChannelId; 3] = [ChannelId::High, ChannelId::Medium, ChannelId::Low];

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(ChannelId::High),
            1 => Some(ChannelId::Medium),
            2 => Some(ChannelId::Low),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Parse a client-supplied channel selector ("0", "1" or "2")
    pub fn parse_selector(selector: &str) -> Result<Self, HandshakeError> {
        match selector {
            "0" => Ok(ChannelId::High),
            "1" => Ok(ChannelId::Medium),
            "2" => Ok(ChannelId::Low),
            other => Err(HandshakeError::InvalidSelector(other.to_string())),
        }
    }
}

impl From<ChannelId> for u8 {
    fn from(id: ChannelId) -> u8 {
        id.index()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Static configuration of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub id: ChannelId,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub codec: Codec,
    /// Disabled channels are never initialized
    pub enabled: bool,
}

impl ChannelConfig {
    /// Factory defaults for a channel
    pub fn default_for(id: ChannelId) -> Self {
        let (width, height, fps) = match id {
            ChannelId::High => (1920, 1080, 30),
            ChannelId::Medium => (1280, 720, 30),
            ChannelId::Low => (640, 480, 15),
        };

        Self {
            id,
            width,
            height,
            fps,
            codec: Codec::H264,
            enabled: true,
        }
    }

    /// Defaults for all three channels
    pub fn defaults() -> Vec<Self> {
        ChannelId::ALL.iter().map(|&id| Self::default_for(id)).collect()
    }

    pub fn resolution(mut self, width: u16, height: u16) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn fps(mut self, fps: u8) -> Self {
        self.fps = fps;
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Human-readable channel name
    pub fn name(&self) -> &'static str {
        match self.id {
            ChannelId::High => "High Resolution",
            ChannelId::Medium => "Medium Resolution",
            ChannelId::Low => "Low Resolution",
        }
    }
}

/// Read-only discovery record for a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub resolution: String,
    pub fps: u8,
    pub codec: String,
    pub shm_path: String,
    pub websocket_path: String,
    pub active: bool,
}
