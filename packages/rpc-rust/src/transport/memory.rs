//! In-process broker with default-exchange queue semantics.
//!
//! Queues are unbounded mpsc channels keyed by name in a `DashMap`. Competing
//! consumers on the same queue share its receiver, so each message is
//! delivered to exactly one of them. Exclusive queues are owned by the
//! declaring connection and removed when it closes, which ends any stream
//! still consuming them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use mqrpc_core::WireMessage;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{Broker, BrokerChannel, BrokerConnection, DeliveryStream, QueueOptions};
use crate::error::TransportError;

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<WireMessage>>>;

struct MemoryQueue {
    tx: mpsc::UnboundedSender<WireMessage>,
    rx: SharedReceiver,
    /// Connection id owning an exclusive queue.
    owner: Option<u64>,
}

struct BrokerState {
    queues: DashMap<String, MemoryQueue>,
    reachable: AtomicBool,
    connect_attempts: AtomicU64,
    next_connection_id: AtomicU64,
}

impl BrokerState {
    /// Routes a message to its queue. Unknown queues drop the message.
    fn route(&self, queue: &str, message: WireMessage) -> bool {
        match self.queues.get(queue) {
            Some(q) => q.tx.send(message).is_ok(),
            None => {
                debug!(queue, "dropping message for unknown queue");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// Shared in-process broker. Cloning yields another handle to the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Creates an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: DashMap::new(),
                reachable: AtomicBool::new(true),
                connect_attempts: AtomicU64::new(0),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Makes subsequent `connect()` calls fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of `connect()` calls seen so far, failed ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Whether a queue with this name currently exists.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Publishes from outside any connection. Returns `false` if the message
    /// was dropped because the queue does not exist.
    pub fn publish(&self, queue: &str, message: WireMessage) -> bool {
        self.state.route(queue, message)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                reason: "in-memory broker is offline".to_string(),
            });
        }
        let id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            cancel: CancellationToken::new(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Connection and channel
// ---------------------------------------------------------------------------

struct MemoryConnection {
    id: u64,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(Arc::new(MemoryChannel {
            connection_id: self.id,
            state: Arc::clone(&self.state),
            cancel: self.cancel.child_token(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        let id = self.id;
        self.state.queues.retain(|_, q| q.owner != Some(id));
        Ok(())
    }
}

struct MemoryChannel {
    connection_id: u64,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
}

impl MemoryChannel {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_owner(&self, queue: &str, owner: Option<u64>) -> Result<(), TransportError> {
        match owner {
            Some(owner) if owner != self.connection_id => Err(TransportError::ResourceLocked {
                queue: queue.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        self.check_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        match self.state.queues.entry(name.clone()) {
            Entry::Occupied(existing) => self.check_owner(&name, existing.get().owner)?,
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(MemoryQueue {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                    owner: options.exclusive.then_some(self.connection_id),
                });
                debug!(queue = %name, exclusive = options.exclusive, "queue declared");
            }
        }
        Ok(name)
    }

    async fn publish(&self, queue: &str, message: WireMessage) -> Result<(), TransportError> {
        self.check_open()?;
        self.state.route(queue, message);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        self.check_open()?;
        let rx = {
            let entry = self
                .state
                .queues
                .get(queue)
                .ok_or_else(|| TransportError::QueueNotFound {
                    queue: queue.to_string(),
                })?;
            self.check_owner(queue, entry.owner)?;
            Arc::clone(&entry.rx)
        };
        debug!(queue, consumer_tag, "consumer attached");

        let deliveries = stream::unfold((rx, self.cancel.clone()), |(rx, cancel)| async move {
            let next = tokio::select! {
                () = cancel.cancelled() => None,
                message = async { rx.lock().await.recv().await } => message,
            };
            next.map(|message| (Ok::<_, TransportError>(message), (rx, cancel)))
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn message(body: &str) -> WireMessage {
        WireMessage {
            body: body.as_bytes().to_vec(),
            ..WireMessage::default()
        }
    }

    async fn channel(broker: &InMemoryBroker) -> (Box<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let conn = broker.connect().await.unwrap();
        let ch = conn.open_channel().await.unwrap();
        (conn, ch)
    }

    #[tokio::test]
    async fn publish_routes_to_named_queue() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue("jobs", QueueOptions::shared()).await.unwrap();
        let mut deliveries = ch.consume("jobs", "t1").await.unwrap();

        ch.publish("jobs", message("hello")).await.unwrap();

        let got = timeout(Duration::from_millis(100), deliveries.next())
            .await
            .expect("timeout")
            .expect("stream open")
            .unwrap();
        assert_eq!(got.body, b"hello");
    }

    #[tokio::test]
    async fn unknown_queue_drops_message() {
        let broker = InMemoryBroker::new();
        assert!(!broker.publish("nowhere", message("lost")));
    }

    #[tokio::test]
    async fn empty_name_generates_queue_name() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let a = ch.declare_queue("", QueueOptions::exclusive()).await.unwrap();
        let b = ch.declare_queue("", QueueOptions::exclusive()).await.unwrap();
        assert!(a.starts_with("amq.gen-"));
        assert_ne!(a, b);
        assert!(broker.queue_exists(&a));
    }

    #[tokio::test]
    async fn redeclare_shared_queue_is_noop() {
        let broker = InMemoryBroker::new();
        let (_c1, ch1) = channel(&broker).await;
        let (_c2, ch2) = channel(&broker).await;
        ch1.declare_queue("RPC_QUEUE", QueueOptions::shared()).await.unwrap();
        assert_eq!(
            ch2.declare_queue("RPC_QUEUE", QueueOptions::shared()).await.unwrap(),
            "RPC_QUEUE"
        );
    }

    #[tokio::test]
    async fn exclusive_queue_is_locked_to_owner() {
        let broker = InMemoryBroker::new();
        let (_c1, ch1) = channel(&broker).await;
        let (_c2, ch2) = channel(&broker).await;
        let name = ch1.declare_queue("", QueueOptions::exclusive()).await.unwrap();

        let err = ch2.consume(&name, "intruder").await.err().unwrap();
        assert!(matches!(err, TransportError::ResourceLocked { .. }));
    }

    #[tokio::test]
    async fn closing_connection_deletes_exclusive_queues() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        let name = ch.declare_queue("", QueueOptions::exclusive()).await.unwrap();
        ch.declare_queue("shared", QueueOptions::shared()).await.unwrap();

        conn.close().await.unwrap();

        assert!(!broker.queue_exists(&name));
        assert!(broker.queue_exists("shared"));
        assert!(matches!(
            ch.publish("shared", message("x")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn closing_channel_ends_consumer_stream() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue("q", QueueOptions::shared()).await.unwrap();
        let mut deliveries = ch.consume("q", "t").await.unwrap();

        ch.close().await.unwrap();

        let next = timeout(Duration::from_millis(100), deliveries.next())
            .await
            .expect("timeout");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn competing_consumers_split_messages() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue("work", QueueOptions::shared()).await.unwrap();
        let mut a = ch.consume("work", "a").await.unwrap();
        let mut b = ch.consume("work", "b").await.unwrap();

        ch.publish("work", message("1")).await.unwrap();
        ch.publish("work", message("2")).await.unwrap();

        let first = timeout(Duration::from_millis(100), a.next()).await.unwrap().unwrap().unwrap();
        let second = timeout(Duration::from_millis(100), b.next()).await.unwrap().unwrap().unwrap();
        let mut bodies = vec![first.body, second.body];
        bodies.sort();
        assert_eq!(bodies, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        assert!(matches!(
            broker.connect().await.err().unwrap(),
            TransportError::Unreachable { .. }
        ));
        broker.set_reachable(true);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }
}
