//! End-to-end fan-out over a loopback WebSocket server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use camstream::channel::{ChannelConfig, ChannelId, ChannelSet};
use camstream::fanout::{FanoutConfig, WirePacket};
use camstream::frame::FrameMeta;
use camstream::server::{ServerConfig, StreamServer};
use camstream::shm::{ConsumerHandle, ShmConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    channels: Arc<ChannelSet>,
    server: Arc<StreamServer>,
    shm: ShmConfig,
    stop: Option<oneshot::Sender<()>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    async fn start(tag: &str, configs: &[ChannelConfig]) -> Self {
        let shm = ShmConfig::default()
            .namespace(&format!("camstream_it_{}_{}", tag, std::process::id()))
            .ring_size(4)
            .max_frame_size(4096);
        let channels = Arc::new(ChannelSet::open(configs, &shm, &FanoutConfig::default()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = channels.spawn_dispatch(&shutdown_rx);

        let config = ServerConfig::with_addr("127.0.0.1:0".parse().unwrap());
        let server = Arc::new(StreamServer::new(config, Arc::new(channels.router())));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop, stop_rx) = oneshot::channel::<()>();
        let serving = Arc::clone(&server);
        tasks.push(tokio::spawn(async move {
            let _ = serving
                .serve(listener, async move {
                    let _ = stop_rx.await;
                })
                .await;
        }));

        Self {
            addr,
            channels,
            server,
            shm,
            stop: Some(stop),
            shutdown,
            tasks,
        }
    }

    async fn connect(&self, path: &str) -> Result<Client, WsError> {
        let url = format!("ws://{}{}", self.addr, path);
        tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws)
    }

    async fn wait_for_connections(&self, channel: ChannelId, count: usize) {
        let registry = Arc::clone(self.channels.get(channel).unwrap().registry());
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.connection_count().await != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn publish(&self, channel: ChannelId, payload: &'static [u8], timestamp: u64) {
        let context = self.channels.get(channel).unwrap();
        let config = context.config();
        let meta = FrameMeta::new(config.codec, config.width, config.height, config.fps)
            .timestamp(timestamp);
        context.on_frame(Bytes::from_static(payload), meta);
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.server.router().close_all().await;
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.channels.shutdown();
    }
}

async fn next_packet(ws: &mut Client) -> WirePacket {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        if let Message::Binary(data) = message {
            return WirePacket::decode(data).unwrap();
        }
    }
}

fn assert_bad_request(result: Result<Client, WsError>) {
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

#[tokio::test]
async fn test_client_receives_only_selected_channel() {
    let harness = Harness::start("selected", &ChannelConfig::defaults()).await;

    let mut client = harness.connect("/?channel=1").await.unwrap();
    harness.wait_for_connections(ChannelId::Medium, 1).await;

    harness.publish(ChannelId::High, b"high", 100);
    harness.publish(ChannelId::Medium, b"medium", 200);
    harness.publish(ChannelId::Low, b"low", 300);

    let packet = next_packet(&mut client).await;
    assert_eq!(packet.channel, ChannelId::Medium);
    assert_eq!(&packet.payload[..], b"medium");
    assert_eq!(packet.capture_timestamp_ms, 200);

    let extra = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(extra.is_err(), "no other channel may reach this client");

    harness.stop().await;
}

#[tokio::test]
async fn test_frames_arrive_in_order() {
    let harness = Harness::start("order", &ChannelConfig::defaults()).await;

    let mut client = harness.connect("/?channel=2").await.unwrap();
    harness.wait_for_connections(ChannelId::Low, 1).await;

    let payloads: [&'static [u8]; 3] = [b"f1", b"f2", b"f3"];
    for (i, payload) in payloads.iter().enumerate() {
        harness.publish(ChannelId::Low, payload, 10 + i as u64);
    }

    for (i, payload) in payloads.iter().enumerate() {
        let packet = next_packet(&mut client).await;
        assert_eq!(&packet.payload[..], *payload);
        assert_eq!(packet.capture_timestamp_ms, 10 + i as u64);
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_local_and_network_paths_agree() {
    let harness = Harness::start("both_paths", &ChannelConfig::defaults()).await;

    let mut consumer = ConsumerHandle::attach(ChannelId::High, &harness.shm).unwrap();
    let mut client = harness.connect("/?channel=0").await.unwrap();
    harness.wait_for_connections(ChannelId::High, 1).await;

    harness.publish(ChannelId::High, b"idr", 0);

    let local = consumer.read_latest().unwrap().unwrap();
    let packet = next_packet(&mut client).await;
    assert_eq!(&local.payload[..], &packet.payload[..]);
    assert_eq!(local.meta.capture_timestamp_ms, packet.capture_timestamp_ms);
    assert!(packet.capture_timestamp_ms > 0);

    consumer.detach();
    harness.stop().await;
}

#[tokio::test]
async fn test_invalid_selectors_rejected() {
    let harness = Harness::start("rejected", &ChannelConfig::defaults()).await;

    assert_bad_request(harness.connect("/").await);
    assert_bad_request(harness.connect("/?channel=3").await);
    assert_bad_request(harness.connect("/?channel=abc").await);

    for channel in ChannelId::ALL {
        harness.wait_for_connections(channel, 0).await;
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.server.stats().snapshot().rejected_handshakes < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    harness.stop().await;
}

#[tokio::test]
async fn test_inactive_channel_rejected() {
    let configs = vec![
        ChannelConfig::default_for(ChannelId::High),
        ChannelConfig::default_for(ChannelId::Medium).disabled(),
        ChannelConfig::default_for(ChannelId::Low),
    ];
    let harness = Harness::start("inactive", &configs).await;

    assert_bad_request(harness.connect("/?channel=1").await);
    assert!(harness.connect("/?channel=2").await.is_ok());

    harness.stop().await;
}

#[tokio::test]
async fn test_client_close_unsubscribes() {
    let harness = Harness::start("close", &ChannelConfig::defaults()).await;

    let mut first = harness.connect("/?channel=0").await.unwrap();
    let mut second = harness.connect("/?channel=0").await.unwrap();
    harness.wait_for_connections(ChannelId::High, 2).await;

    first.close(None).await.unwrap();
    harness.wait_for_connections(ChannelId::High, 1).await;

    harness.publish(ChannelId::High, b"still here", 5);
    let packet = next_packet(&mut second).await;
    assert_eq!(&packet.payload[..], b"still here");

    second.send(Message::Close(None)).await.unwrap();
    harness.wait_for_connections(ChannelId::High, 0).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let harness = Harness::start("shutdown", &ChannelConfig::defaults()).await;

    let mut client = harness.connect("/?channel=1").await.unwrap();
    harness.wait_for_connections(ChannelId::Medium, 1).await;

    harness.stop().await;

    let end = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok(), "client should observe the close");
}
