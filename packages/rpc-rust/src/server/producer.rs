//! Publishes replies to a caller's private queue.

use std::sync::Arc;

use mqrpc_core::{CorrelationId, ReplyEnvelope, ResponseBody};
use tracing::debug;

use crate::error::RpcError;
use crate::transport::BrokerChannel;

/// Fire-and-forget reply publisher bound to an outbound channel.
#[derive(Clone)]
pub struct ResponseProducer {
    channel: Arc<dyn BrokerChannel>,
}

impl ResponseProducer {
    #[must_use]
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    /// Publishes `body` to `reply_to` with `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded or the publish fails.
    pub async fn produce(
        &self,
        reply_to: &str,
        correlation_id: &CorrelationId,
        body: &ResponseBody,
    ) -> Result<(), RpcError> {
        let message = ReplyEnvelope::new(correlation_id.clone(), body.clone()).to_wire()?;
        self.channel.publish(reply_to, message).await?;
        debug!(%correlation_id, reply_to, success = body.success, "reply published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::transport::{Broker, InMemoryBroker, QueueOptions};

    #[tokio::test]
    async fn reply_carries_correlation_id_and_body() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        let queue = channel.declare_queue("", QueueOptions::exclusive()).await.unwrap();
        let mut deliveries = channel.consume(&queue, "t").await.unwrap();

        let id = CorrelationId::generate();
        let body = ResponseBody::success("done");
        ResponseProducer::new(Arc::clone(&channel))
            .produce(&queue, &id, &body)
            .await
            .unwrap();

        let message = deliveries.next().await.unwrap().unwrap();
        let reply = ReplyEnvelope::from_wire(&message).unwrap();
        assert_eq!(reply.correlation_id, id);
        assert_eq!(reply.body, body);
    }
}
