//! Server-side receive loop body: decodes requests and dispatches them.

use std::sync::Arc;

use async_trait::async_trait;
use mqrpc_core::{EnvelopeError, RequestEnvelope, WireMessage};
use tracing::{debug, error, info, warn};

use super::drain::InFlight;
use super::producer::ResponseProducer;
use crate::connection::ConsumerRole;
use crate::error::TransportError;
use crate::service::dispatcher::Dispatcher;
use crate::telemetry;
use crate::transport::{BrokerChannel, QueueOptions};

/// Header added to dead-lettered copies of malformed requests.
pub const DEAD_LETTER_REASON_HEADER: &str = "x-mqrpc-error";

/// Consumes the shared request queue.
///
/// Each well-formed request is dispatched on its own task, so a slow handler
/// never stalls the loop. Malformed requests are logged, counted and either
/// dropped or copied to the dead-letter queue; they never get a reply.
pub struct RequestConsumer {
    dispatcher: Dispatcher,
    request_queue: String,
    dead_letter_queue: Option<String>,
    in_flight: InFlight,
    drain_timeout: std::time::Duration,
}

impl RequestConsumer {
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        request_queue: String,
        dead_letter_queue: Option<String>,
        drain_timeout: std::time::Duration,
    ) -> Self {
        Self {
            dispatcher,
            request_queue,
            dead_letter_queue,
            in_flight: InFlight::default(),
            drain_timeout,
        }
    }

    /// Dispatches currently running.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.count()
    }

    async fn reject(
        &self,
        error: &EnvelopeError,
        mut message: WireMessage,
        outbound: &Arc<dyn BrokerChannel>,
    ) {
        metrics::counter!(
            telemetry::MALFORMED_MESSAGES,
            "role" => "server",
            "reason" => malformed_reason(error)
        )
        .increment(1);
        match error.correlation_id() {
            Some(id) => warn!(correlation_id = %id, error = %error, "dropping malformed request"),
            None => warn!(error = %error, "dropping malformed request"),
        }

        let Some(dlq) = &self.dead_letter_queue else {
            return;
        };
        message
            .properties
            .headers
            .insert(DEAD_LETTER_REASON_HEADER.to_string(), error.to_string());
        match outbound.publish(dlq, message).await {
            Ok(()) => debug!(queue = %dlq, "malformed request dead-lettered"),
            Err(e) => error!(queue = %dlq, error = %e, "failed to dead-letter request"),
        }
    }
}

fn malformed_reason(error: &EnvelopeError) -> &'static str {
    match error {
        EnvelopeError::MissingCorrelationId => "missing_correlation_id",
        EnvelopeError::MissingReplyTo { .. } => "missing_reply_to",
        EnvelopeError::InvalidPayload { .. } => "invalid_payload",
        EnvelopeError::Encode(_) => "encode",
    }
}

#[async_trait]
impl ConsumerRole for RequestConsumer {
    fn role(&self) -> &'static str {
        "server"
    }

    /// The shared queue is non-exclusive so several servers can compete for
    /// requests. The dead-letter queue is declared alongside it.
    async fn declare_queue(&self, channel: &dyn BrokerChannel) -> Result<String, TransportError> {
        if let Some(dlq) = &self.dead_letter_queue {
            channel.declare_queue(dlq, QueueOptions::shared()).await?;
        }
        channel
            .declare_queue(&self.request_queue, QueueOptions::shared())
            .await
    }

    async fn on_message(&self, message: WireMessage, outbound: &Arc<dyn BrokerChannel>) {
        let request = match RequestEnvelope::from_wire(&message) {
            Ok(request) => request,
            Err(e) => {
                self.reject(&e, message, outbound).await;
                return;
            }
        };

        debug!(
            operation = %request.operation,
            correlation_id = %request.correlation_id,
            reply_to = %request.reply_to,
            "request received"
        );

        let dispatcher = self.dispatcher.clone();
        let producer = ResponseProducer::new(Arc::clone(outbound));
        let guard = self.in_flight.enter();
        tokio::spawn(async move {
            let RequestEnvelope {
                operation,
                correlation_id,
                reply_to,
                payload,
            } = request;
            dispatcher
                .handle(operation, &reply_to, correlation_id, payload, &producer)
                .await;
            drop(guard);
        });
    }

    async fn drain(&self) {
        let running = self.in_flight.count();
        if running == 0 {
            return;
        }
        info!(running, "waiting for in-flight operations");
        if !self.in_flight.wait_for_drain(self.drain_timeout).await {
            warn!(
                remaining = self.in_flight.count(),
                "in-flight operations still running after drain timeout"
            );
        }
    }
}
