//! WebSocket transport for fan-out connections

use std::io;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{Sink, SinkExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::fanout::FrameSink;

/// Writes each wire packet as one binary WebSocket message
pub struct WsSink<S> {
    inner: S,
}

impl<S> WsSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> FrameSink for WsSink<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    fn send_packet(&mut self, packet: Bytes) -> BoxFuture<'_, io::Result<()>> {
        async move {
            self.inner
                .send(Message::Binary(packet))
                .await
                .map_err(into_io)
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async move {
            let _ = self.inner.close().await;
        }
        .boxed()
    }
}

fn into_io(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, e)
        }
        other => io::Error::other(other),
    }
}
