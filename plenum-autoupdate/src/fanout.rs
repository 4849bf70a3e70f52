//! Change notification fan-out across workers and connections.
//!
//! After a batch commits, every worker process must learn that a new change
//! id exists so it can push updates to its own locally-held connections. The
//! notice carries only the change id: each consumer re-derives the diff from
//! its own baseline, so the broadcast stays cheap and lost or reordered
//! notices self-heal on the next one.
//!
//! ```text
//! change_elements ──► FanoutBus (this process) ──► consumers here
//!        │
//!        └──► redis PUBLISH ──► RedisFanout listener on every other
//!             worker ──► that worker's FanoutBus ──► consumers there
//! ```
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers, with
//! lock-free atomic stats on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use serde_json::Value;
use uuid::Uuid;

use crate::cache::provider::CacheError;

/// "A new change id exists." Payload-free by design; consumers re-derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice {
    pub change_id: u64,
}

/// Fan-out statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub notices_published: u64,
    pub notices_ignored: u64,
    pub subscribers: usize,
}

/// Lock-free stats — publish() never takes a lock.
struct AtomicFanoutStats {
    published: AtomicU64,
    ignored: AtomicU64,
}

/// Process-local broadcast of change notices.
///
/// Publishing is monotonic: a notice at or below the highest already
/// published change id is ignored, because the newer notice subsumes it (a
/// consumer re-derives everything from its own baseline anyway). This is
/// what keeps interleaved notices from several workers ordered per process.
pub struct FanoutBus {
    sender: broadcast::Sender<ChangeNotice>,
    last_change_id: AtomicU64,
    stats: AtomicFanoutStats,
    capacity: usize,
}

impl FanoutBus {
    /// `capacity` is the per-subscriber buffer; lagging subscribers drop old
    /// notices, which is harmless here (the next notice catches them up).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            last_change_id: AtomicU64::new(0),
            stats: AtomicFanoutStats {
                published: AtomicU64::new(0),
                ignored: AtomicU64::new(0),
            },
            capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.sender.subscribe()
    }

    /// Publish a notice to all local subscribers.
    ///
    /// Returns the number of subscribers that received it; 0 when there are
    /// none or the notice was stale.
    pub fn publish(&self, change_id: u64) -> usize {
        let previous = self.last_change_id.fetch_max(change_id, Ordering::AcqRel);
        if previous >= change_id {
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(ChangeNotice { change_id }).unwrap_or(0)
    }

    /// Highest change id ever published on this bus.
    pub fn last_change_id(&self) -> u64 {
        self.last_change_id.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            notices_published: self.stats.published.load(Ordering::Relaxed),
            notices_ignored: self.stats.ignored.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A client-to-client notify, relayed to every other connection.
#[derive(Debug, Clone)]
pub struct NotifyEnvelope {
    /// Connection that sent it; that connection skips its own relay.
    pub from: Uuid,
    pub content: Value,
}

/// Broadcast channel for notify relays, separate from change notices so
/// notify traffic never interacts with change-id ordering.
pub struct NotifyRelay {
    sender: broadcast::Sender<Arc<NotifyEnvelope>>,
}

impl NotifyRelay {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<NotifyEnvelope>> {
        self.sender.subscribe()
    }

    pub fn publish(&self, from: Uuid, content: Value) -> usize {
        self.sender
            .send(Arc::new(NotifyEnvelope { from, content }))
            .unwrap_or(0)
    }
}

/// Redis pub/sub bridge for multi-worker deployments.
///
/// Publishes local change ids to a redis channel and republishes remote ones
/// into the local [`FanoutBus`]. Single-process deployments skip this
/// entirely.
pub struct RedisFanout {
    client: Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisFanout {
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            channel: channel.into(),
        })
    }

    /// Publish a change id to all workers (including this one; the local
    /// bus's monotonic guard drops the echo).
    pub async fn publish(&self, change_id: u64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(change_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Spawn the listener task: remote notices feed the local bus until the
    /// subscription fails (connection loss ends the task; the caller decides
    /// whether to reconnect).
    pub fn spawn_listener(&self, bus: Arc<FanoutBus>) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    log::error!("Fan-out subscribe failed: {e}");
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                log::error!("Fan-out subscribe to '{channel}' failed: {e}");
                return;
            }
            log::info!("Fan-out listening on redis channel '{channel}'");

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<u64>() {
                    Ok(change_id) => {
                        bus.publish(change_id);
                    }
                    Err(e) => {
                        log::warn!("Ignoring malformed fan-out notice: {e}");
                    }
                }
            }
            log::warn!("Fan-out listener on '{channel}' ended");
        })
    }
}
