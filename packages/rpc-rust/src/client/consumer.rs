//! Client-side receive loop body: pairs replies with waiting callers.

use std::sync::Arc;

use async_trait::async_trait;
use mqrpc_core::{EnvelopeError, ReplyEnvelope, WireMessage};
use tracing::{debug, warn};

use super::pending::PendingReplies;
use crate::connection::ConsumerRole;
use crate::error::{RpcError, TransportError};
use crate::telemetry;
use crate::transport::{BrokerChannel, QueueOptions};

/// Consumes the private reply queue.
pub struct ReplyConsumer {
    pending: Arc<PendingReplies>,
}

impl ReplyConsumer {
    #[must_use]
    pub fn new(pending: Arc<PendingReplies>) -> Self {
        Self { pending }
    }

    fn discard(reason: &'static str) {
        metrics::counter!(telemetry::REPLIES_DISCARDED, "reason" => reason).increment(1);
    }
}

#[async_trait]
impl ConsumerRole for ReplyConsumer {
    fn role(&self) -> &'static str {
        "client"
    }

    /// Anonymous, exclusive, broker-named queue.
    async fn declare_queue(&self, channel: &dyn BrokerChannel) -> Result<String, TransportError> {
        channel.declare_queue("", QueueOptions::exclusive()).await
    }

    async fn on_message(&self, message: WireMessage, _outbound: &Arc<dyn BrokerChannel>) {
        match ReplyEnvelope::from_wire(&message) {
            Ok(reply) => {
                let id = reply.correlation_id;
                if self.pending.resolve(&id, reply.body) {
                    metrics::counter!(telemetry::REPLIES_RESOLVED).increment(1);
                    debug!(correlation_id = %id, "reply resolved");
                } else {
                    Self::discard("unmatched");
                    debug!(correlation_id = %id, "discarding unmatched reply");
                }
            }
            Err(EnvelopeError::MissingCorrelationId) => {
                Self::discard("missing_correlation_id");
                warn!("discarding reply without correlation id");
            }
            Err(e) => {
                metrics::counter!(telemetry::MALFORMED_MESSAGES, "role" => "client", "reason" => "invalid_payload")
                    .increment(1);
                let Some(id) = e.correlation_id().cloned() else {
                    warn!(error = %e, "discarding malformed reply");
                    return;
                };
                let reason = e.to_string();
                if self.pending.fail(&id, RpcError::MalformedReply { reason }) {
                    warn!(correlation_id = %id, error = %e, "reply could not be decoded");
                } else {
                    debug!(correlation_id = %id, error = %e, "discarding malformed unmatched reply");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mqrpc_core::{CorrelationId, MessageProperties, ResponseBody};

    use super::*;
    use crate::transport::{Broker, InMemoryBroker};

    async fn outbound() -> Arc<dyn BrokerChannel> {
        let conn = InMemoryBroker::new().connect().await.unwrap();
        conn.open_channel().await.unwrap()
    }

    fn reply(id: &CorrelationId, body: &ResponseBody) -> WireMessage {
        ReplyEnvelope::new(id.clone(), body.clone()).to_wire().unwrap()
    }

    #[tokio::test]
    async fn matching_reply_resolves_waiter() {
        let pending = Arc::new(PendingReplies::new());
        let consumer = ReplyConsumer::new(Arc::clone(&pending));
        let id = CorrelationId::generate();
        let rx = pending.register(id.clone(), "NOTIFY", Duration::from_secs(5));

        let body = ResponseBody::success("ok");
        consumer.on_message(reply(&id, &body), &outbound().await).await;

        assert_eq!(rx.await.unwrap().unwrap(), body);
    }

    #[tokio::test]
    async fn duplicate_reply_is_discarded() {
        let pending = Arc::new(PendingReplies::new());
        let consumer = ReplyConsumer::new(Arc::clone(&pending));
        let id = CorrelationId::generate();
        let rx = pending.register(id.clone(), "NOTIFY", Duration::from_secs(5));
        let out = outbound().await;

        consumer.on_message(reply(&id, &ResponseBody::success("first")), &out).await;
        consumer.on_message(reply(&id, &ResponseBody::success("second")), &out).await;

        assert_eq!(rx.await.unwrap().unwrap().message, "first");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn malformed_reply_fails_waiter() {
        let pending = Arc::new(PendingReplies::new());
        let consumer = ReplyConsumer::new(Arc::clone(&pending));
        let id = CorrelationId::generate();
        let rx = pending.register(id.clone(), "NOTIFY", Duration::from_secs(5));

        let message = WireMessage {
            body: b"not json".to_vec(),
            properties: MessageProperties {
                correlation_id: Some(id.to_string()),
                ..MessageProperties::default()
            },
        };
        consumer.on_message(message, &outbound().await).await;

        assert!(matches!(rx.await.unwrap(), Err(RpcError::MalformedReply { .. })));
    }

    #[tokio::test]
    async fn reply_without_id_leaves_registry_untouched() {
        let pending = Arc::new(PendingReplies::new());
        let consumer = ReplyConsumer::new(Arc::clone(&pending));
        let _rx = pending.register(CorrelationId::generate(), "NOTIFY", Duration::from_secs(5));

        let message = WireMessage {
            body: br#"{"success":true,"message":"x"}"#.to_vec(),
            ..WireMessage::default()
        };
        consumer.on_message(message, &outbound().await).await;

        assert_eq!(pending.len(), 1);
    }
}
