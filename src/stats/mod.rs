//! Statistics collection

pub mod metrics;

pub use metrics::{ChannelStats, FrameCounters, ServerStats, ServerStatsSnapshot};
