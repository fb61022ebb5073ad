//! Server role: consumes the shared request queue and answers each request.
//!
//! - [`consumer`]: request queue receive loop body
//! - [`producer`]: reply publisher
//! - [`drain`]: in-flight dispatch tracking for graceful close

pub mod consumer;
pub mod drain;
pub mod producer;

use std::sync::Arc;

use mqrpc_core::{CorrelationId, ResponseBody};

use crate::config::RpcConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{ConnectionError, RpcError};
use crate::service::dispatcher::Dispatcher;
use crate::service::registry::HandlerRegistry;
use crate::transport::Broker;

pub use consumer::RequestConsumer;
pub use producer::ResponseProducer;

/// Server stub.
///
/// Handlers are fixed at construction. `initialize()` starts consuming; each
/// request is answered on its reply address until `close()`.
pub struct RpcServer {
    connection: Connection<RequestConsumer>,
    config: Arc<RpcConfig>,
}

impl RpcServer {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: Arc<RpcConfig>, registry: HandlerRegistry) -> Self {
        let dispatcher = Dispatcher::new(registry, &config);
        let consumer = RequestConsumer::new(
            dispatcher,
            config.request_queue.clone(),
            config.dead_letter_queue.clone(),
            config.drain_timeout,
        );
        let connection = Connection::new(
            broker,
            Arc::new(consumer),
            config.backoff.clone(),
            &config.consumer_tag_prefix,
        );
        Self { connection, config }
    }

    /// Connects, declares the shared request queue and starts consuming.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a `ConnectionError` if the broker cannot be reached or the
    /// queue cannot be set up. A later call retries, unless the server has
    /// been closed.
    pub async fn initialize(&self) -> Result<(), ConnectionError> {
        self.connection.ensure_ready().await.map(|_| ())
    }

    /// Publishes `body` to `reply_to` with `correlation_id`, initializing
    /// first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be initialized, the body cannot
    /// be encoded or the publish fails.
    pub async fn produce(
        &self,
        reply_to: &str,
        correlation_id: &CorrelationId,
        body: &ResponseBody,
    ) -> Result<(), RpcError> {
        let session = self.connection.ensure_ready().await?;
        ResponseProducer::new(Arc::clone(&session.outbound))
            .produce(reply_to, correlation_id, body)
            .await
    }

    /// Stops consuming, waits up to `drain_timeout` for running handlers to
    /// reply, then closes the channels and the connection.
    ///
    /// # Errors
    ///
    /// Returns the first transport error met while closing.
    pub async fn close(&self) -> Result<(), RpcError> {
        self.connection.close().await.map_err(RpcError::from)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Name of the queue being consumed.
    #[must_use]
    pub fn request_queue(&self) -> &str {
        &self.config.request_queue
    }

    /// Handlers currently running.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.connection.role().in_flight()
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("state", &self.state())
            .field("request_queue", &self.request_queue())
            .finish_non_exhaustive()
    }
}
