//! Client role: publishes requests and awaits their replies.
//!
//! - [`pending`]: correlation id -> waiting caller registry
//! - [`handle`]: the future a caller awaits
//! - [`consumer`]: reply queue receive loop body
//! - [`reaper`]: background eviction of expired requests

pub mod consumer;
pub mod handle;
pub mod pending;
pub mod reaper;

use std::sync::Arc;
use std::time::Duration;

use mqrpc_core::{CorrelationId, RequestEnvelope, ResponseBody};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::connection::{Connection, ConnectionState, Session};
use crate::error::{ConnectionError, RpcError};
use crate::service::worker::BackgroundWorker;
use crate::telemetry;
use crate::transport::Broker;

pub use consumer::ReplyConsumer;
pub use handle::ReplyHandle;
pub use pending::PendingReplies;
pub use reaper::{PendingReaper, ReaperTask};

/// Client stub. Share it behind an `Arc`; every method takes `&self`.
///
/// The connection is established on first use, so the first request is
/// never published before the reply queue exists.
pub struct RpcClient {
    connection: Connection<ReplyConsumer>,
    pending: Arc<PendingReplies>,
    config: Arc<RpcConfig>,
    reaper: Mutex<Option<BackgroundWorker<PendingReaper>>>,
}

impl RpcClient {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: Arc<RpcConfig>) -> Self {
        let pending = Arc::new(PendingReplies::new());
        let connection = Connection::new(
            broker,
            Arc::new(ReplyConsumer::new(Arc::clone(&pending))),
            config.backoff.clone(),
            &config.consumer_tag_prefix,
        );
        Self {
            connection,
            pending,
            config,
            reaper: Mutex::new(None),
        }
    }

    /// Connects, declares the private reply queue and starts consuming it.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a `ConnectionError` if the broker cannot be reached or the
    /// reply queue cannot be set up. A later call retries, unless the client
    /// has been closed.
    pub async fn initialize(&self) -> Result<(), ConnectionError> {
        self.session().await.map(|_| ())
    }

    /// Calls `operation` with `payload` and waits for the reply, up to the
    /// configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`] and [`ReplyHandle`].
    pub async fn produce<P>(&self, operation: &str, payload: &P) -> Result<ResponseBody, RpcError>
    where
        P: Serialize + ?Sized,
    {
        self.produce_with_timeout(operation, payload, self.config.default_request_timeout)
            .await
    }

    /// Like [`RpcClient::produce`] with an explicit deadline.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`] and [`ReplyHandle`].
    pub async fn produce_with_timeout<P>(
        &self,
        operation: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<ResponseBody, RpcError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        self.send(operation, payload, timeout).await?.await
    }

    /// Publishes a request and returns a handle resolving to its reply.
    ///
    /// The pending entry is registered before the publish, so a fast reply
    /// cannot race past it.
    ///
    /// # Errors
    ///
    /// - `RpcError::Connection` if the client cannot be initialized
    /// - `RpcError::Envelope` if the payload cannot be encoded
    /// - `RpcError::Transport` if the publish fails; nothing stays registered
    pub async fn send(
        &self,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<ReplyHandle, RpcError> {
        let session = self.session().await?;
        let envelope = RequestEnvelope::new(operation, session.queue.clone(), payload);
        let message = envelope.to_wire()?;
        let id = envelope.correlation_id;

        let slot = self.pending.register(id.clone(), operation, timeout);
        let handle = ReplyHandle::new(id.clone(), slot, timeout, Arc::clone(&self.pending));

        if let Err(e) = session
            .outbound
            .publish(&self.config.request_queue, message)
            .await
        {
            warn!(correlation_id = %id, operation, error = %e, "request publish failed");
            // Dropping the handle evicts the entry.
            drop(handle);
            return Err(e.into());
        }

        // Raced a concurrent `close()` that already failed the registry.
        if self.connection.state() == ConnectionState::Closed {
            self.pending.fail(&id, RpcError::ConnectionClosed);
        }

        metrics::counter!(telemetry::REQUESTS_PUBLISHED).increment(1);
        debug!(correlation_id = %id, operation, queue = %self.config.request_queue, "request published");
        Ok(handle)
    }

    /// Fails the pending request `id` with `RpcError::Cancelled`. Returns
    /// `false` if it already completed.
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.pending.fail(id, RpcError::Cancelled)
    }

    /// Fails every overdue request now instead of at the next reaper tick.
    pub fn sweep_expired(&self) -> usize {
        self.pending.expire(Instant::now())
    }

    /// Name of the private reply queue, once initialized.
    #[must_use]
    pub fn reply_queue(&self) -> Option<String> {
        self.connection.queue()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Fails every outstanding request with `ConnectionClosed`, then tears
    /// the connection down and stops the reaper. Requests registered while
    /// the teardown runs are failed the same way. The client cannot be reused.
    ///
    /// # Errors
    ///
    /// Returns the first transport error met while closing.
    pub async fn close(&self) -> Result<(), RpcError> {
        let failed = self.pending.fail_all(|| RpcError::ConnectionClosed);
        if failed > 0 {
            info!(failed, "failed outstanding requests on close");
        }
        let closed = self.connection.close().await;
        let late = self.pending.fail_all(|| RpcError::ConnectionClosed);
        if late > 0 {
            info!(failed = late, "failed requests registered during close");
        }

        let reaper = self.reaper.lock().take();
        if let Some(mut reaper) = reaper {
            reaper.stop().await;
        }
        closed.map_err(RpcError::from)
    }

    async fn session(&self) -> Result<Arc<Session>, ConnectionError> {
        let session = self.connection.ensure_ready().await?;
        self.start_reaper();
        Ok(session)
    }

    fn start_reaper(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.is_none() && self.connection.state() == ConnectionState::Ready {
            *reaper = Some(BackgroundWorker::start(
                PendingReaper::new(Arc::clone(&self.pending)),
                self.config.reaper_interval,
            ));
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("state", &self.state())
            .field("reply_queue", &self.reply_queue())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}
