//! Request and reply envelopes and their broker wire form.
//!
//! A [`WireMessage`] is what a broker moves: a JSON body plus the metadata
//! properties `correlation_id`, `reply_to`, `content_type` and string
//! headers. Requests carry their operation tag in the `operation` header;
//! replies carry only the correlation id.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::codec::{self, CONTENT_TYPE_JSON};
use crate::correlation::CorrelationId;
use crate::response::ResponseBody;

/// Header carrying the operation tag on a request.
pub const OPERATION_HEADER: &str = "operation";

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// Metadata attached to a message by the broker protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A message as published to or delivered from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl WireMessage {
    /// The correlation id property, if present and non-empty.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        non_empty(self.properties.correlation_id.as_deref()).map(CorrelationId::from)
    }

    /// The reply-to property, if present and non-empty.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        non_empty(self.properties.reply_to.as_deref())
    }

    /// A header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.properties.headers.get(name).map(String::as_str)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An inbound message that does not have the shape of a request or reply.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message has no correlation id")]
    MissingCorrelationId,
    #[error("request {correlation_id} has no reply address")]
    MissingReplyTo { correlation_id: CorrelationId },
    #[error("message body is not valid JSON: {source}")]
    InvalidPayload {
        correlation_id: Option<CorrelationId>,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl EnvelopeError {
    /// The correlation id of the offending message, when it had one.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::MissingReplyTo { correlation_id } => Some(correlation_id),
            Self::InvalidPayload { correlation_id, .. } => correlation_id.as_ref(),
            Self::MissingCorrelationId | Self::Encode(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RequestEnvelope
// ---------------------------------------------------------------------------

/// A request travelling from a client stub to the shared request queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Operation tag selecting the server-side handler.
    pub operation: String,
    pub correlation_id: CorrelationId,
    /// Queue the reply must be published to.
    pub reply_to: String,
    pub payload: Value,
}

impl RequestEnvelope {
    /// Creates a request with a freshly generated correlation id.
    #[must_use]
    pub fn new(operation: impl Into<String>, reply_to: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            correlation_id: CorrelationId::generate(),
            reply_to: reply_to.into(),
            payload,
        }
    }

    /// Encodes the request into its wire form.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Encode` if the payload cannot be serialized.
    pub fn to_wire(&self) -> Result<WireMessage, EnvelopeError> {
        let mut headers = BTreeMap::new();
        headers.insert(OPERATION_HEADER.to_string(), self.operation.clone());
        Ok(WireMessage {
            body: codec::encode(&self.payload)?,
            properties: MessageProperties {
                correlation_id: Some(self.correlation_id.to_string()),
                reply_to: Some(self.reply_to.clone()),
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
                headers,
            },
        })
    }

    /// Decodes a delivered request.
    ///
    /// A missing `operation` header decodes as the empty tag; the dispatcher
    /// then answers it as an invalid operation.
    ///
    /// # Errors
    ///
    /// - `MissingCorrelationId` if the correlation id property is absent
    /// - `MissingReplyTo` if the reply-to property is absent
    /// - `InvalidPayload` if the body is not JSON
    pub fn from_wire(message: &WireMessage) -> Result<Self, EnvelopeError> {
        let correlation_id = message
            .correlation_id()
            .ok_or(EnvelopeError::MissingCorrelationId)?;
        let Some(reply_to) = message.reply_to() else {
            return Err(EnvelopeError::MissingReplyTo { correlation_id });
        };
        let reply_to = reply_to.to_string();
        let payload = codec::decode(&message.body).map_err(|source| {
            EnvelopeError::InvalidPayload {
                correlation_id: Some(correlation_id.clone()),
                source,
            }
        })?;

        Ok(Self {
            operation: message.header(OPERATION_HEADER).unwrap_or_default().to_string(),
            correlation_id,
            reply_to,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// ReplyEnvelope
// ---------------------------------------------------------------------------

/// A reply travelling from a server stub to a private reply queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    pub correlation_id: CorrelationId,
    pub body: ResponseBody,
}

impl ReplyEnvelope {
    #[must_use]
    pub fn new(correlation_id: CorrelationId, body: ResponseBody) -> Self {
        Self {
            correlation_id,
            body,
        }
    }

    /// Encodes the reply into its wire form.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Encode` if the body cannot be serialized.
    pub fn to_wire(&self) -> Result<WireMessage, EnvelopeError> {
        Ok(WireMessage {
            body: codec::encode(&self.body)?,
            properties: MessageProperties {
                correlation_id: Some(self.correlation_id.to_string()),
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
                ..MessageProperties::default()
            },
        })
    }

    /// Decodes a delivered reply.
    ///
    /// # Errors
    ///
    /// - `MissingCorrelationId` if the correlation id property is absent
    /// - `InvalidPayload` if the body is not a JSON response body; the error
    ///   still carries the correlation id so the waiter can be failed
    pub fn from_wire(message: &WireMessage) -> Result<Self, EnvelopeError> {
        let correlation_id = message
            .correlation_id()
            .ok_or(EnvelopeError::MissingCorrelationId)?;
        match codec::decode::<ResponseBody>(&message.body) {
            Ok(body) => Ok(Self {
                correlation_id,
                body,
            }),
            Err(source) => Err(EnvelopeError::InvalidPayload {
                correlation_id: Some(correlation_id),
                source,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn request_wire(correlation_id: Option<&str>, reply_to: Option<&str>, body: &[u8]) -> WireMessage {
        let mut headers = BTreeMap::new();
        headers.insert(OPERATION_HEADER.to_string(), "NOTIFY".to_string());
        WireMessage {
            body: body.to_vec(),
            properties: MessageProperties {
                correlation_id: correlation_id.map(str::to_string),
                reply_to: reply_to.map(str::to_string),
                content_type: None,
                headers,
            },
        }
    }

    #[test]
    fn request_wire_carries_metadata() {
        let request = RequestEnvelope::new("NOTIFY", "amq.gen-reply", json!({"to": "ada"}));
        let wire = request.to_wire().unwrap();

        assert_eq!(wire.header(OPERATION_HEADER), Some("NOTIFY"));
        assert_eq!(wire.reply_to(), Some("amq.gen-reply"));
        assert_eq!(wire.correlation_id(), Some(request.correlation_id.clone()));
        assert_eq!(wire.properties.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(RequestEnvelope::from_wire(&wire).unwrap(), request);
    }

    #[test]
    fn request_without_correlation_id_is_malformed() {
        let wire = request_wire(None, Some("reply"), b"{}");
        assert!(matches!(
            RequestEnvelope::from_wire(&wire),
            Err(EnvelopeError::MissingCorrelationId)
        ));
    }

    #[test]
    fn request_without_reply_to_is_malformed() {
        let wire = request_wire(Some("abc"), None, b"{}");
        let err = RequestEnvelope::from_wire(&wire).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingReplyTo { .. }));
        assert_eq!(err.correlation_id(), Some(&CorrelationId::from("abc")));
    }

    #[test]
    fn empty_properties_count_as_missing() {
        let wire = request_wire(Some(""), Some("reply"), b"{}");
        assert!(matches!(
            RequestEnvelope::from_wire(&wire),
            Err(EnvelopeError::MissingCorrelationId)
        ));
    }

    #[test]
    fn request_with_bad_json_is_malformed() {
        let wire = request_wire(Some("abc"), Some("reply"), b"{not json");
        let err = RequestEnvelope::from_wire(&wire).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidPayload { .. }));
    }

    #[test]
    fn missing_operation_header_decodes_as_empty_tag() {
        let mut wire = request_wire(Some("abc"), Some("reply"), b"{}");
        wire.properties.headers.clear();
        let request = RequestEnvelope::from_wire(&wire).unwrap();
        assert_eq!(request.operation, "");
    }

    #[test]
    fn reply_wire_has_only_correlation_id() {
        let reply = ReplyEnvelope::new(CorrelationId::from("abc"), ResponseBody::success("ok"));
        let wire = reply.to_wire().unwrap();
        assert_eq!(wire.correlation_id(), Some(CorrelationId::from("abc")));
        assert!(wire.reply_to().is_none());
        assert!(wire.properties.headers.is_empty());
        assert_eq!(ReplyEnvelope::from_wire(&wire).unwrap(), reply);
    }

    #[test]
    fn reply_with_bad_body_keeps_correlation_id() {
        let mut wire = ReplyEnvelope::new(CorrelationId::from("abc"), ResponseBody::success("ok"))
            .to_wire()
            .unwrap();
        wire.body = b"[1, 2".to_vec();
        let err = ReplyEnvelope::from_wire(&wire).unwrap_err();
        assert_eq!(err.correlation_id(), Some(&CorrelationId::from("abc")));
    }

    proptest! {
        #[test]
        fn arbitrary_bodies_never_panic(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let wire = request_wire(Some("abc"), Some("reply"), &body);
            let _ = RequestEnvelope::from_wire(&wire);
            let _ = ReplyEnvelope::from_wire(&wire);
        }

        #[test]
        fn correlation_id_survives_any_string(id in "[^\\x00]{1,64}") {
            let reply = ReplyEnvelope::new(CorrelationId::from(id.as_str()), ResponseBody::failure("x"));
            let decoded = ReplyEnvelope::from_wire(&reply.to_wire().unwrap()).unwrap();
            prop_assert_eq!(decoded.correlation_id.as_str(), id.as_str());
        }
    }
}
