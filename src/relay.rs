//! Outbound relay forwarder
//!
//! Pushes one channel's packets to a remote relay server over a client
//! WebSocket. The forwarder subscribes to the channel like any network
//! client, so a slow relay link is bounded by the same write deadline and
//! eviction rules. Lost connections are retried with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::channel::ChannelId;
use crate::error::Result;
use crate::fanout::CloseReason;
use crate::router::ChannelRouter;
use crate::server::WsSink;

const CAMERA_ID_HEADER: &str = "camera-id";

/// Relay connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Relay endpoint, e.g. `ws://relay.example:8080/ws`
    pub url: String,

    /// Sent as the `Camera-ID` header
    pub camera_id: String,

    /// Sent as `Authorization: Bearer <token>` when present
    pub token: Option<String>,

    /// Channel forwarded to the relay
    pub channel: ChannelId,

    /// First reconnect delay
    pub initial_backoff: Duration,

    /// Reconnect delay ceiling
    pub max_backoff: Duration,

    /// TCP connect plus WebSocket upgrade must finish within this time
    pub connect_timeout: Duration,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>, camera_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            camera_id: camera_id.into(),
            token: None,
            channel: ChannelId::Medium,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn channel(mut self, channel: ChannelId) -> Self {
        self.channel = channel;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upgrade request carrying the camera headers
    pub fn request(&self) -> Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();

        headers.insert(
            HeaderName::from_static(CAMERA_ID_HEADER),
            header_value(&self.camera_id)?,
        );
        if let Some(token) = &self.token {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
        }
        Ok(request)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| WsError::HttpFormat(e.into()).into())
}

/// Exponential reconnect delay: doubles per failure up to a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum SessionEnd {
    Reconnect,
    Stop,
}

/// Background task forwarding a channel to a relay
pub struct RelayForwarder;

impl RelayForwarder {
    /// Start forwarding until `shutdown` flips to true
    pub fn spawn(
        config: RelayConfig,
        router: Arc<ChannelRouter>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(run(config, router, shutdown))
    }
}

async fn run(config: RelayConfig, router: Arc<ChannelRouter>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);

    tracing::info!(url = %config.url, channel = %config.channel, camera_id = %config.camera_id, "Relay forwarder started");

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        match session(&config, &router, &mut shutdown, &mut backoff).await {
            Ok(SessionEnd::Stop) => break,
            Ok(SessionEnd::Reconnect) => {}
            Err(e) => {
                tracing::warn!(url = %config.url, error = %e, "Relay connection failed");
            }
        }

        let delay = backoff.next_delay();
        tracing::info!(url = %config.url, delay_secs = delay.as_secs_f64(), "Relay disconnected, reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(url = %config.url, "Relay forwarder stopped");
}

async fn session(
    config: &RelayConfig,
    router: &ChannelRouter,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<SessionEnd> {
    let request = config.request()?;
    let (ws, response) = tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

    tracing::info!(url = %config.url, status = %response.status(), "Connected to relay");
    backoff.reset();

    let (sink, mut incoming) = ws.split();
    let subscription = match router
        .subscribe(config.channel, format!("relay {}", config.url), Box::new(WsSink::new(sink)))
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            // Channel is not active; retrying cannot help
            tracing::error!(channel = %config.channel, error = %e, "Relay channel unavailable");
            return Ok(SessionEnd::Stop);
        }
    };

    let end = loop {
        tokio::select! {
            reason = subscription.closed() => {
                tracing::debug!(reason = ?reason, "Relay subscription closed");
                break if reason == CloseReason::Shutdown { SessionEnd::Stop } else { SessionEnd::Reconnect };
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    tracing::info!(message = %text.as_str(), "Relay control message");
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(frame = ?frame, "Relay closed connection");
                    break SessionEnd::Reconnect;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Relay read error");
                    break SessionEnd::Reconnect;
                }
                None => break SessionEnd::Reconnect,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break SessionEnd::Stop;
                }
            }
        }
    };

    let reason = match end {
        SessionEnd::Stop => CloseReason::Shutdown,
        SessionEnd::Reconnect => CloseReason::ClientClosed,
    };
    subscription.close(reason).await;
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{ChannelQueue, ConnectionRegistry, FanoutConfig, QueuedFrame, WirePacket};
    use bytes::Bytes;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response,
    };

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_request_headers() {
        let config = RelayConfig::new("ws://127.0.0.1:9/ws", "cam-42").token("secret");
        let request = config.request().unwrap();

        assert_eq!(request.headers()["camera-id"], "cam-42");
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer secret");
    }

    #[test]
    fn test_request_without_token() {
        let request = RelayConfig::new("ws://127.0.0.1:9/ws", "cam").request().unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RelayConfig::new("not a url", "cam").request().is_err());
        assert!(RelayConfig::new("ws://h/ws", "bad\nid").request().is_err());
    }

    #[tokio::test]
    async fn test_forwards_channel_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (headers_tx, headers_rx) = tokio::sync::oneshot::channel();
        let relay = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let callback = |req: &ServerRequest, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                let camera = req.headers().get("camera-id").cloned();
                let _ = headers_tx.send(camera);
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(socket, callback).await.unwrap();
            ws.next().await.unwrap().unwrap()
        });

        let queue = Arc::new(ChannelQueue::new(ChannelId::Low, 30));
        let registry = Arc::new(ConnectionRegistry::new(ChannelId::Low, queue, FanoutConfig::default()));
        let router = Arc::new(ChannelRouter::new().with_channel(Arc::clone(&registry)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = RelayConfig::new(format!("ws://{}/ws", addr), "cam-7").channel(ChannelId::Low);
        let forwarder = RelayForwarder::spawn(config, router, shutdown_rx);

        let camera = headers_rx.await.unwrap().unwrap();
        assert_eq!(camera, "cam-7");

        // Wait for the forwarder to subscribe
        while registry.connection_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry
            .dispatch_once(QueuedFrame::new(Bytes::from_static(b"nal"), 77))
            .await;

        let message = relay.await.unwrap();
        let packet = WirePacket::decode(message.into_data()).unwrap();
        assert_eq!(packet.channel, ChannelId::Low);
        assert_eq!(&packet.payload[..], b"nal");
        assert_eq!(packet.capture_timestamp_ms, 77);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), forwarder)
            .await
            .unwrap()
            .unwrap();
    }
}
