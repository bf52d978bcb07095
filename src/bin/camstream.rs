//! Streamer daemon
//!
//! Opens the camera channels, publishes their frames to shared memory and
//! to WebSocket subscribers, and optionally forwards one channel to a
//! relay server.
//!
//! Run with: cargo run --bin camstream -- [OPTIONS]
//!
//! Examples:
//!   camstream                                        # all channels, port 8765
//!   camstream --source 1=clip_720p.h264              # feed channel 1 from a file
//!   camstream --disable 0 --discovery-file /run/camstream/channels.json
//!   camstream --relay-url ws://relay:8080/ws --camera-id cam-01 --relay-token s3cret
//!
//! Subscribing:
//!   websocat --binary ws://localhost:8765/?channel=1

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;

use camstream::channel::{ChannelConfig, ChannelId, ChannelSet};
use camstream::fanout::FanoutConfig;
use camstream::relay::{RelayConfig, RelayForwarder};
use camstream::server::{ServerConfig, StreamServer};
use camstream::shm::ShmConfig;
use camstream::source::{spawn_source, AnnexBFileSource};

#[derive(Debug, Parser)]
#[command(name = "camstream", version, about = "Camera frame distribution daemon")]
struct Args {
    /// WebSocket listen address
    #[arg(long, default_value = "0.0.0.0:8765")]
    bind: SocketAddr,

    /// Maximum concurrent WebSocket connections (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_connections: usize,

    /// Per-frame write deadline for network clients, in milliseconds
    #[arg(long, default_value_t = 2000)]
    write_deadline_ms: u64,

    /// Shared-memory name namespace (default: the system-wide names)
    #[arg(long)]
    namespace: Option<String>,

    /// Channels to leave uninitialized
    #[arg(long = "disable", value_parser = parse_channel)]
    disabled: Vec<ChannelId>,

    /// Feed a channel from an H.264 Annex-B file, as `N=path`
    #[arg(long = "source", value_parser = parse_source)]
    sources: Vec<(ChannelId, PathBuf)>,

    /// Write discovery metadata of the active channels to this file
    #[arg(long)]
    discovery_file: Option<PathBuf>,

    /// Log channel statistics every N seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    stats_interval: u64,

    /// Relay server to forward a channel to
    #[arg(long)]
    relay_url: Option<String>,

    /// Camera id announced to the relay
    #[arg(long, default_value = "camera")]
    camera_id: String,

    /// Bearer token for the relay
    #[arg(long)]
    relay_token: Option<String>,

    /// Channel forwarded to the relay
    #[arg(long, default_value = "1", value_parser = parse_channel)]
    relay_channel: ChannelId,
}

fn parse_channel(s: &str) -> Result<ChannelId, String> {
    ChannelId::parse_selector(s).map_err(|e| e.to_string())
}

fn parse_source(s: &str) -> Result<(ChannelId, PathBuf), String> {
    let (channel, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected N=path, got {:?}", s))?;
    Ok((parse_channel(channel)?, PathBuf::from(path)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut shm = ShmConfig::default();
    if let Some(ns) = &args.namespace {
        shm = shm.namespace(ns);
    }
    let fanout = FanoutConfig::default().write_deadline(Duration::from_millis(args.write_deadline_ms));

    let configs: Vec<ChannelConfig> = ChannelConfig::defaults()
        .into_iter()
        .map(|c| if args.disabled.contains(&c.id) { c.disabled() } else { c })
        .collect();

    let channels = Arc::new(ChannelSet::open(&configs, &shm, &fanout));
    if channels.is_empty() {
        return Err("no channel could be initialized".into());
    }

    if let Some(path) = &args.discovery_file {
        let json = serde_json::to_string_pretty(&channels.discovery())?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Discovery metadata written");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch = channels.spawn_dispatch(&shutdown_rx);
    let router = Arc::new(channels.router());

    let mut source_threads = Vec::new();
    for (id, path) in &args.sources {
        let Some(context) = channels.get(*id).filter(|c| c.is_active()) else {
            tracing::warn!(channel = %id, "Source given for an inactive channel, ignored");
            continue;
        };
        let source = AnnexBFileSource::open(path, context.config())?;
        source_threads.push(spawn_source(
            Box::new(source),
            Arc::clone(context),
            shutdown_rx.clone(),
        )?);
    }

    let relay = args.relay_url.as_ref().map(|url| {
        let mut config = RelayConfig::new(url, &args.camera_id).channel(args.relay_channel);
        if let Some(token) = &args.relay_token {
            config = config.token(token);
        }
        RelayForwarder::spawn(config, Arc::clone(&router), shutdown_rx.clone())
    });

    let reporter = (args.stats_interval > 0).then(|| {
        spawn_stats_reporter(
            Arc::clone(&channels),
            Duration::from_secs(args.stats_interval),
            shutdown_rx.clone(),
        )
    });

    let server_config = ServerConfig::with_addr(args.bind).max_connections(args.max_connections);
    let server = StreamServer::new(server_config, Arc::clone(&router));
    let served = server.run_until(shutdown_signal()).await;

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    router.close_all().await;
    if let Some(relay) = relay {
        let _ = relay.await;
    }
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    for handle in dispatch {
        let _ = handle.await;
    }
    let joined = tokio::task::spawn_blocking(move || {
        for thread in source_threads {
            let _ = thread.join();
        }
    });
    let _ = joined.await;

    for stats in channels.stats().await {
        tracing::info!(
            channel = stats.channel,
            frames_in = stats.frames_in,
            ring_dropped = stats.ring_dropped,
            queue_dropped = stats.queue_dropped,
            evictions = stats.evictions,
            "Final channel stats"
        );
    }
    tracing::info!(stats = ?server.stats().snapshot(), "Final server stats");

    channels.shutdown();
    served?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn spawn_stats_reporter(
    channels: Arc<ChannelSet>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for stats in channels.stats().await {
                        match serde_json::to_string(&stats) {
                            Ok(json) => tracing::info!(channel = stats.channel, stats = %json, "Channel stats"),
                            Err(e) => tracing::warn!(error = %e, "Failed to serialize stats"),
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
