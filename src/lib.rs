//! camstream: encoded video frame distribution for multi-channel cameras
//!
//! Each camera channel (high, medium, low resolution) publishes encoded
//! pictures on two paths:
//!
//! - a shared-memory ring that local processes read with latest-wins
//!   semantics ([`shm`]), and
//! - a bounded drop-oldest queue drained to WebSocket clients, each bound
//!   to one channel at handshake time ([`fanout`], [`router`], [`server`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use camstream::{ChannelConfig, ChannelSet, FanoutConfig, ServerConfig, ShmConfig, StreamServer};
//!
//! #[tokio::main]
//! async fn main() -> camstream::Result<()> {
//!     let channels = ChannelSet::open(&ChannelConfig::defaults(), &ShmConfig::default(), &FanoutConfig::default());
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     let _dispatch = channels.spawn_dispatch(&shutdown_rx);
//!
//!     let server = StreamServer::new(ServerConfig::default(), Arc::new(channels.router()));
//!     server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!
//!     channels.shutdown();
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
pub mod fanout;
pub mod frame;
pub mod relay;
pub mod router;
pub mod server;
pub mod shm;
pub mod source;
pub mod stats;

pub use channel::{ChannelConfig, ChannelContext, ChannelId, ChannelInfo, ChannelSet};
pub use error::{Error, HandshakeError, PacketError, Result, ShmError};
pub use fanout::{ChannelQueue, ConnectionRegistry, FanoutConfig, WirePacket};
pub use frame::{Codec, FrameMeta, LatestFrame};
pub use relay::{RelayConfig, RelayForwarder};
pub use router::{ChannelRouter, ConnectionPhase, Subscription};
pub use server::{ServerConfig, StreamServer};
pub use shm::{ConsumerHandle, ProducerHandle, ShmConfig};
pub use source::{AnnexBFileSource, FrameSource};
