//! Network fan-out
//!
//! Every channel has a bounded drop-oldest queue fed by the encoder callback
//! and a registry of subscribed connections drained by a dispatch task.
//!
//! ```text
//!  encoder callback ──push──► ChannelQueue (30, drop-oldest)
//!                                  │
//!                          dispatch task (pop)
//!                                  │ WirePacket::encode (once)
//!               ┌──────────────────┼──────────────────┐
//!               ▼                  ▼                  ▼
//!        ConnectionEntry    ConnectionEntry    ConnectionEntry
//!        (write deadline)   (write deadline)   (write deadline)
//! ```
//!
//! `Bytes` is reference counted, so every connection shares the same packet
//! allocation.

pub mod config;
pub mod connection;
pub mod packet;
pub mod queue;
pub mod registry;

pub use config::FanoutConfig;
pub use connection::{CloseReason, ConnectionEntry, ConnectionStats, Delivery, FrameSink};
pub use packet::{WirePacket, PACKET_OVERHEAD};
pub use queue::{ChannelQueue, PushOutcome, QueuedFrame, DEFAULT_QUEUE_CAPACITY};
pub use registry::ConnectionRegistry;

#[cfg(test)]
pub(crate) mod testing {
    use std::io;

    use bytes::Bytes;
    use futures_util::future::{self, BoxFuture, FutureExt};
    use tokio::sync::mpsc;

    use super::FrameSink;

    /// Forwards every packet to a channel
    pub struct RecordingSink(mpsc::UnboundedSender<Bytes>);

    pub fn recording_sink() -> (RecordingSink, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RecordingSink(tx), rx)
    }

    impl FrameSink for RecordingSink {
        fn send_packet(&mut self, packet: Bytes) -> BoxFuture<'_, io::Result<()>> {
            let result = self
                .0
                .send(packet)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe));
            future::ready(result).boxed()
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            future::ready(()).boxed()
        }
    }

    /// Never completes a write
    pub struct StalledSink;

    impl FrameSink for StalledSink {
        fn send_packet(&mut self, _packet: Bytes) -> BoxFuture<'_, io::Result<()>> {
            future::pending().boxed()
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            future::pending().boxed()
        }
    }

    /// Fails every write
    pub struct FailingSink;

    impl FrameSink for FailingSink {
        fn send_packet(&mut self, _packet: Bytes) -> BoxFuture<'_, io::Result<()>> {
            future::ready(Err(io::Error::from(io::ErrorKind::ConnectionReset))).boxed()
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            future::ready(()).boxed()
        }
    }
}
