//! WebSocket server for network subscribers
//!
//! Clients connect to `ws://host:8765/?channel=N` and receive one binary
//! message per frame of channel `N` (see [`crate::fanout::WirePacket`]).

pub mod config;
pub mod listener;
pub mod ws;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use listener::StreamServer;
pub use ws::WsSink;
