//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! Everything is published through the default exchange with the queue name
//! as routing key. Consumers run with `no_ack`, so a delivery counts as
//! handled once it is received.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use mqrpc_core::{MessageProperties, WireMessage};
use tracing::debug;

use super::{Broker, BrokerChannel, BrokerConnection, DeliveryStream, QueueOptions};
use crate::error::TransportError;

const DEFAULT_EXCHANGE: &str = "";
const REPLY_SUCCESS: u16 = 200;

/// Broker reached at an `amqp://` URL.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, TransportError> {
        let inner = lapin::Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Unreachable {
                reason: e.to_string(),
            })?;
        debug!("amqp connection established");
        Ok(Box::new(AmqpConnection { inner }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let inner = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel { inner }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        let declare = QueueDeclareOptions {
            exclusive: options.exclusive,
            durable: options.durable,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .inner
            .queue_declare(name, declare, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn publish(&self, queue: &str, message: WireMessage) -> Result<(), TransportError> {
        let properties = to_amqp_properties(&message.properties);
        // Confirms are not enabled on these channels; the returned confirm
        // resolves immediately and is not awaited.
        let _confirm = self
            .inner
            .basic_publish(
                DEFAULT_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        debug!(queue, consumer_tag, "amqp consumer started");
        Ok(consumer
            .map(|delivery| delivery.map(from_delivery).map_err(TransportError::from))
            .boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Property mapping
// ---------------------------------------------------------------------------

fn to_amqp_properties(props: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(id) = &props.correlation_id {
        out = out.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        out = out.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(content_type) = &props.content_type {
        out = out.with_content_type(ShortString::from(content_type.clone()));
    }
    if !props.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &props.headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        out = out.with_headers(table);
    }
    out
}

fn from_amqp_properties(props: &BasicProperties) -> MessageProperties {
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_text(value).map(|text| (key.as_str().to_string(), text))
                })
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    MessageProperties {
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        headers,
    }
}

/// Text form of a header value. Non-string values are ignored.
fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn from_delivery(delivery: Delivery) -> WireMessage {
    let Delivery {
        data, properties, ..
    } = delivery;
    WireMessage {
        body: data,
        properties: from_amqp_properties(&properties),
    }
}
