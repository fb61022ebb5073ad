//! Lazily established broker connection shared by one role.
//!
//! A `Connection` owns the transport connection, an outbound channel for
//! publishing, an inbound channel for consuming, the role's queue and the
//! consumer task feeding deliveries to the role.
//!
//! State machine: Uninitialized -> Initializing -> Ready -> Closed
//!
//! Initialization is single-flight: concurrent callers queue on the link
//! mutex and find the connection `Ready` once the first one finishes. A
//! failed attempt returns to `Uninitialized` so a later call can retry.
//! `Closed` is terminal.

mod backoff;

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use futures_util::StreamExt;
use mqrpc_core::WireMessage;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BackoffConfig;
use crate::error::{ConnectionError, TransportError};
use crate::transport::{Broker, BrokerChannel, BrokerConnection, DeliveryStream};

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet, or the last attempt failed.
    Uninitialized,
    /// An initialization attempt is in flight.
    Initializing,
    /// Channels are open and the consumer is running.
    Ready,
    /// Torn down; cannot be reused.
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConsumerRole trait
// ---------------------------------------------------------------------------

/// What a connection does with its inbound side.
#[async_trait]
pub trait ConsumerRole: Send + Sync + 'static {
    /// Role name for logs and errors (`"client"`, `"server"`).
    fn role(&self) -> &'static str;

    /// Declares the queue this role consumes and returns its name.
    async fn declare_queue(&self, channel: &dyn BrokerChannel) -> Result<String, TransportError>;

    /// Handles one delivery. Must not fail the loop.
    async fn on_message(&self, message: WireMessage, outbound: &Arc<dyn BrokerChannel>);

    /// Runs after the consumer loop has stopped and before the channels are
    /// closed. Default is a no-op.
    async fn drain(&self) {}
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Resources usable while the connection is `Ready`.
#[derive(Clone)]
pub struct Session {
    pub outbound: Arc<dyn BrokerChannel>,
    /// Queue consumed by this role.
    pub queue: String,
}

/// Channels and consumer stream opened on a fresh connection.
struct Opened {
    outbound: Arc<dyn BrokerChannel>,
    inbound: Arc<dyn BrokerChannel>,
    queue: String,
    deliveries: DeliveryStream,
}

struct Link {
    connection: Box<dyn BrokerConnection>,
    outbound: Arc<dyn BrokerChannel>,
    inbound: Arc<dyn BrokerChannel>,
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
}

pub struct Connection<R: ConsumerRole> {
    broker: Arc<dyn Broker>,
    role: Arc<R>,
    backoff: BackoffConfig,
    consumer_tag: String,
    state: ArcSwap<ConnectionState>,
    link: Mutex<Option<Link>>,
    session: ArcSwapOption<Session>,
}

impl<R: ConsumerRole> Connection<R> {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        role: Arc<R>,
        backoff: BackoffConfig,
        consumer_tag_prefix: &str,
    ) -> Self {
        let consumer_tag = format!(
            "{consumer_tag_prefix}-{}-{}",
            role.role(),
            Uuid::new_v4().simple()
        );
        Self {
            broker,
            role,
            backoff,
            consumer_tag,
            state: ArcSwap::from_pointee(ConnectionState::Uninitialized),
            link: Mutex::new(None),
            session: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        **self.state.load()
    }

    #[must_use]
    pub fn role(&self) -> &Arc<R> {
        &self.role
    }

    /// Queue consumed by this role, once `Ready`.
    #[must_use]
    pub fn queue(&self) -> Option<String> {
        self.session.load().as_ref().map(|s| s.queue.clone())
    }

    /// Establishes the connection if needed and returns the live session.
    ///
    /// Calls while `Ready` return immediately.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::Unreachable` once every connect attempt failed
    /// - `ConnectionError::Setup` if opening channels, declaring the queue or
    ///   starting the consumer failed
    /// - `ConnectionError::Closed` after `close()`
    pub async fn ensure_ready(&self) -> Result<Arc<Session>, ConnectionError> {
        if let Some(session) = self.session.load_full() {
            return Ok(session);
        }

        let mut link = self.link.lock().await;
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        // Another caller finished initializing while we waited for the lock.
        if let Some(session) = self.session.load_full() {
            return Ok(session);
        }

        self.state.store(Arc::new(ConnectionState::Initializing));
        match self.establish().await {
            Ok((established, session)) => {
                *link = Some(established);
                self.session.store(Some(Arc::clone(&session)));
                self.state.store(Arc::new(ConnectionState::Ready));
                info!(role = self.role.role(), queue = %session.queue, "connection ready");
                Ok(session)
            }
            Err(e) => {
                self.state.store(Arc::new(ConnectionState::Uninitialized));
                warn!(role = self.role.role(), error = %e, "connection initialization failed");
                Err(e)
            }
        }
    }

    /// Tears the connection down: stops the consumer, lets the role drain,
    /// then closes the inbound channel, the outbound channel and the
    /// connection, in that order.
    ///
    /// Closing a connection that was never initialized only logs a warning.
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first transport error met while closing. The connection is
    /// `Closed` regardless.
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut guard = self.link.lock().await;
        let Some(link) = guard.take() else {
            if self.state() != ConnectionState::Closed {
                warn!(role = self.role.role(), "close called on an uninitialized connection");
            }
            return Ok(());
        };

        self.session.store(None);
        self.state.store(Arc::new(ConnectionState::Closed));

        link.cancel.cancel();
        if let Err(e) = link.consumer.await {
            warn!(role = self.role.role(), error = %e, "consumer task ended abnormally");
        }
        self.role.drain().await;

        let inbound = link.inbound.close().await;
        let outbound = link.outbound.close().await;
        let connection = link.connection.close().await;
        info!(role = self.role.role(), "connection closed");
        inbound.and(outbound).and(connection)
    }

    async fn establish(&self) -> Result<(Link, Arc<Session>), ConnectionError> {
        let connection = self.connect_with_backoff().await?;
        match self.open(connection.as_ref()).await {
            Ok(Opened {
                outbound,
                inbound,
                queue,
                deliveries,
            }) => {
                let cancel = CancellationToken::new();
                let consumer = tokio::spawn(consume(
                    Arc::clone(&self.role),
                    deliveries,
                    Arc::clone(&outbound),
                    cancel.clone(),
                    queue.clone(),
                ));
                let session = Arc::new(Session {
                    outbound: Arc::clone(&outbound),
                    queue,
                });
                let link = Link {
                    connection,
                    outbound,
                    inbound,
                    cancel,
                    consumer,
                };
                Ok((link, session))
            }
            Err(source) => {
                if let Err(e) = connection.close().await {
                    debug!(error = %e, "closing partial connection failed");
                }
                Err(ConnectionError::Setup {
                    role: self.role.role(),
                    source,
                })
            }
        }
    }

    async fn open(&self, connection: &dyn BrokerConnection) -> Result<Opened, TransportError> {
        let outbound = connection.open_channel().await?;
        let inbound = connection.open_channel().await?;
        let queue = self.role.declare_queue(inbound.as_ref()).await?;
        let deliveries = inbound.consume(&queue, &self.consumer_tag).await?;
        Ok(Opened {
            outbound,
            inbound,
            queue,
            deliveries,
        })
    }

    async fn connect_with_backoff(&self) -> Result<Box<dyn BrokerConnection>, ConnectionError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.broker.connect().await {
                Ok(connection) => return Ok(connection),
                Err(source) if attempt >= max_attempts => {
                    return Err(ConnectionError::Unreachable {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    let delay = backoff::delay_for(&self.backoff, attempt);
                    warn!(
                        role = self.role.role(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl<R: ConsumerRole> Drop for Connection<R> {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.cancel.cancel();
        }
    }
}

/// Receive loop: one delivery at a time, in arrival order. A stream error is
/// terminal, same as the stream ending; there is no reconnect.
async fn consume<R: ConsumerRole>(
    role: Arc<R>,
    mut deliveries: DeliveryStream,
    outbound: Arc<dyn BrokerChannel>,
    cancel: CancellationToken,
    queue: String,
) {
    debug!(role = role.role(), queue = %queue, "consumer started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = deliveries.next() => match next {
                Some(Ok(message)) => role.on_message(message, &outbound).await,
                Some(Err(e)) => {
                    warn!(role = role.role(), queue = %queue, error = %e, "delivery stream failed");
                    break;
                }
                None => {
                    warn!(role = role.role(), queue = %queue, "delivery stream ended");
                    break;
                }
            },
        }
    }
    debug!(role = role.role(), queue = %queue, "consumer stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
