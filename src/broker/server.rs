//! Broker server: TCP accept loop, per-connection writer tasks, and the
//! expiry sweeper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::config::{Config, StorageBackend};
use crate::core::clock::TokioClock;
use crate::core::notifier::NoopNotifier;
use crate::core::subscribers::ConnectionHandle;
use crate::metrics;
use crate::storage::{memory::MemoryStorage, sqlite::SqliteStorage, Storage};

use super::connection::Connection;
use super::Broker;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Selects the storage backend once, at startup.
pub async fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    Ok(match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Sqlite => Arc::new(SqliteStorage::connect(&config.storage.path).await?),
    })
}

/// Starts the fastPort broker with settings from `fastport.toml` and the
/// environment. Storage init failure is fatal.
pub async fn start_broker(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind_addr.clone();
    info!("starting fastPort broker on {}", bind_addr);

    let storage = build_storage(&config).await?;
    let broker = Broker::new(
        config,
        storage,
        Arc::new(TokioClock),
        Arc::new(NoopNotifier),
    );
    broker.bootstrap().await?;

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("broker bound to {}", bind_addr);

    spawn_sweeper(&broker);
    metrics::set_ready(true);
    serve(broker, listener).await
}

/// Accept loop over an already-bound listener (tests bind on port 0).
pub async fn serve(broker: Arc<Broker>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        socket.set_nodelay(true)?;
        debug!("client connected: {}", peer_addr);

        let broker = Arc::clone(&broker);
        task::spawn(async move {
            handle_socket(broker, socket).await;
            debug!("client disconnected: {}", peer_addr);
        });
    }
}

pub async fn handle_socket(broker: Arc<Broker>, socket: TcpStream) {
    let (reader, writer) = socket.into_split();
    let outbound = spawn_connection_writer(writer, broker.config.server.outbound_queue);
    let handle = ConnectionHandle::new(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed), outbound);
    Connection::new(broker, handle).run(reader).await;
}

/// Per-connection writer task: all frames leave through this channel, so
/// frames to one peer keep their send order and a slow peer never blocks
/// anyone else.
pub fn spawn_connection_writer<W>(writer: W, capacity: usize) -> mpsc::Sender<Bytes>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity);
    tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
            // Flush eagerly when the queue drained; otherwise let frames
            // coalesce into the buffer.
            if rx.is_empty() && writer.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

/// Periodic expiry sweep: session-level drops through the registry, then
/// the storage-level message sweep.
pub fn spawn_sweeper(broker: &Arc<Broker>) {
    let broker = Arc::clone(broker);
    tokio::spawn(async move {
        let interval = Duration::from_secs(broker.config.cleanup.interval_s.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate; skip it
        loop {
            ticker.tick().await;
            if let Err(e) = broker.registry.drop_expired_sessions().await {
                error!(error = %e, "session expiry sweep failed");
            }
            match broker.storage.cleanup_expired(broker.clock.now_ms()).await {
                Ok(counts) if counts.messages > 0 || counts.sessions > 0 => {
                    info!(
                        messages = counts.messages,
                        sessions = counts.sessions,
                        "expiry sweep removed state"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "message expiry sweep failed"),
            }
        }
    });
}
