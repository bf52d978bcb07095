//! WebSocket stream server
//!
//! Handles the TCP accept loop, the WebSocket upgrade with channel selection,
//! and the per-connection reader that notices disconnects.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::ChannelId;
use crate::error::{HandshakeError, Result};
use crate::fanout::CloseReason;
use crate::router::{ChannelRouter, ConnectionPhase};
use crate::server::config::ServerConfig;
use crate::server::ws::WsSink;
use crate::stats::ServerStats;

/// Frame fan-out server
pub struct StreamServer {
    config: ServerConfig,
    router: Arc<ChannelRouter>,
    stats: Arc<ServerStats>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl StreamServer {
    /// Create a new server routing clients through `router`
    pub fn new(config: ServerConfig, router: Arc<ChannelRouter>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            router,
            stats: Arc::new(ServerStats::new()),
            connection_semaphore,
        }
    }

    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            channels = ?self.router.active_channels(),
            "Stream server listening"
        );
        Ok(listener)
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        tracing::debug!(peer = %peer_addr, "New connection");

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let config = self.config.clone();
        let router = Arc::clone(&self.router);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let _permit = permit;
            stats.connection_opened();
            serve_client(socket, peer_addr, &config, &router, &stats).await;
            stats.connection_closed();
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

/// Drive one client from handshake to close
async fn serve_client(
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: &ServerConfig,
    router: &ChannelRouter,
    stats: &ServerStats,
) {
    let mut phase = ConnectionPhase::Connecting;
    let mut selection: Option<std::result::Result<ChannelId, HandshakeError>> = None;

    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        let selected = router.select_channel(request.uri().query());
        let result = match &selected {
            Ok(_) => Ok(response),
            Err(e) => Err(reject(e)),
        };
        selection = Some(selected);
        result
    };

    let upgrade = tokio::time::timeout(
        config.handshake_timeout,
        tokio_tungstenite::accept_hdr_async(socket, callback),
    )
    .await;

    let (ws, channel) = match (upgrade, selection) {
        (Ok(Ok(ws)), Some(Ok(channel))) => (ws, channel),
        (_, Some(Err(e))) => {
            stats.handshake_rejected();
            tracing::debug!(peer = %peer_addr, error = %e, "Handshake rejected");
            return;
        }
        (Err(_), _) => {
            stats.handshake_rejected();
            tracing::debug!(peer = %peer_addr, error = %HandshakeError::Timeout, "Handshake rejected");
            return;
        }
        (Ok(Err(e)), _) => {
            tracing::debug!(peer = %peer_addr, error = %e, "WebSocket upgrade failed");
            return;
        }
        // The callback runs before any upgrade can succeed
        (Ok(Ok(_)), None) => return,
    };

    let (sink, mut incoming) = ws.split();
    let subscription = match router
        .subscribe(channel, peer_addr.to_string(), Box::new(WsSink::new(sink)))
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            stats.handshake_rejected();
            tracing::debug!(peer = %peer_addr, error = %e, "Subscription rejected");
            return;
        }
    };

    let connection_id = subscription.id();
    tracing::debug!(
        connection_id,
        peer = %peer_addr,
        channel = %channel,
        from = ?phase,
        to = ?ConnectionPhase::Subscribed,
        "Connection phase changed"
    );
    phase = ConnectionPhase::Subscribed;

    // Client messages carry nothing for us: there is no in-band channel
    // switch. Reading only serves to notice the close.
    let reason = loop {
        tokio::select! {
            reason = subscription.closed() => break reason,
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id, error = %e, "Read error");
                    break CloseReason::ClientClosed;
                }
            },
        }
    };

    subscription.close(reason).await;
    tracing::debug!(
        connection_id,
        from = ?phase,
        to = ?ConnectionPhase::Closed,
        reason = ?reason,
        "Connection phase changed"
    );
}

fn reject(error: &HandshakeError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}
