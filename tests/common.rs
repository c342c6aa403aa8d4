#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

use fastport::broker::{server, Broker};
use fastport::config::Config;
use fastport::core::clock::TokioClock;
use fastport::core::notifier::{NoopNotifier, OfflineNotifier};
use fastport::core::protocol::{self, ClientFrame, ServerFrame, CHUNK_MARKER, TEXT_MARKER};
use fastport::storage::memory::MemoryStorage;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        fastport::logging::init_logging();
    });
}

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub addr: SocketAddr,
}

/// Boots an in-memory broker on an ephemeral port.
pub async fn spawn_broker() -> TestBroker {
    spawn_broker_with(Config::default()).await
}

pub async fn spawn_broker_with(config: Config) -> TestBroker {
    spawn_broker_custom(config, Arc::new(NoopNotifier)).await
}

pub async fn spawn_broker_custom(
    config: Config,
    notifier: Arc<dyn OfflineNotifier>,
) -> TestBroker {
    init_logging();
    let broker = Broker::new(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(TokioClock),
        notifier,
    );
    broker.bootstrap().await.expect("bootstrap");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let serving = Arc::clone(&broker);
    tokio::spawn(async move {
        let _ = server::serve(serving, listener).await;
    });
    TestBroker { broker, addr }
}

/// Anything the broker can send us.
#[derive(Debug)]
pub enum Inbound {
    Frame(ServerFrame),
    Chunk(Vec<u8>),
}

pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        stream.set_nodelay(true).expect("nodelay");
        Self { stream }
    }

    pub async fn send(&mut self, frame: &ClientFrame) {
        let wire = protocol::client_frame_to_wire(frame);
        self.stream.write_all(&wire).await.expect("send frame");
    }

    /// Sends a binary chunk body (starting with the 0x02 marker).
    pub async fn send_chunk_body(&mut self, body: &[u8]) {
        let wire = protocol::chunk_to_wire(body);
        self.stream.write_all(&wire).await.expect("send chunk");
    }

    /// Raw bytes, for malformed-input tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("send raw");
    }

    pub async fn recv_any(&mut self) -> Inbound {
        timeout(Duration::from_secs(2), self.read_one())
            .await
            .expect("timed out waiting for a frame")
    }

    pub async fn recv(&mut self) -> ServerFrame {
        match self.recv_any().await {
            Inbound::Frame(frame) => frame,
            Inbound::Chunk(_) => panic!("expected text frame, got binary chunk"),
        }
    }

    pub async fn recv_chunk(&mut self) -> Vec<u8> {
        match self.recv_any().await {
            Inbound::Chunk(body) => body,
            Inbound::Frame(frame) => panic!("expected binary chunk, got {frame:?}"),
        }
    }

    /// Asserts that nothing arrives for `ms` milliseconds.
    pub async fn expect_silence(&mut self, ms: u64) {
        let res = timeout(Duration::from_millis(ms), self.read_one()).await;
        assert!(res.is_err(), "expected silence, got {:?}", res.unwrap());
    }

    /// Asserts the peer closes the connection within two seconds.
    pub async fn expect_closed(&mut self) {
        let deadline = Duration::from_secs(2);
        let closed = timeout(deadline, async {
            let mut buf = [0u8; 64];
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection was not closed");
    }

    async fn read_one(&mut self) -> Inbound {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .expect("read length");
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.expect("read body");
        match body.first() {
            Some(&TEXT_MARKER) => Inbound::Frame(
                protocol::parse_server_frame(&body[1..]).expect("parse server frame"),
            ),
            Some(&CHUNK_MARKER) => Inbound::Chunk(body),
            other => panic!("unknown frame marker {other:?}"),
        }
    }

    /// init + success assertion.
    pub async fn init(&mut self, session: &str, password: &str) {
        self.init_as(session, password, None).await;
    }

    pub async fn init_as(&mut self, session: &str, password: &str, user_id: Option<&str>) {
        self.send(&ClientFrame::Init {
            session_name: session.into(),
            password: password.into(),
            user_id: user_id.map(str::to_string),
        })
        .await;
        match self.recv().await {
            ServerFrame::InitResponse { success: true, .. } => {}
            other => panic!("init failed: {other:?}"),
        }
    }

    /// subscribe + response assertion.
    pub async fn subscribe(&mut self, topic: &str) {
        self.send(&ClientFrame::Subscribe {
            topic: topic.into(),
        })
        .await;
        match self.recv().await {
            ServerFrame::SubscribeResponse { success: true, .. } => {}
            other => panic!("subscribe failed: {other:?}"),
        }
    }

    pub async fn publish(&mut self, topic: &str, data: &str, message_id: &str) -> ServerFrame {
        self.send(&ClientFrame::Publish {
            topic: topic.into(),
            data: data.into(),
            hash: "h".into(),
            timestamp: 1,
            message_id: message_id.into(),
        })
        .await;
        self.recv().await
    }

    pub async fn ack(&mut self, topic: &str, message_id: &str) {
        self.send(&ClientFrame::Ack {
            topic: topic.into(),
            message_id: message_id.into(),
        })
        .await;
    }
}
