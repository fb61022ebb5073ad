//! Error types surfaced by the transport, the connection and the client stub.

use mqrpc_core::EnvelopeError;

/// Broker-level failure reported by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("broker unreachable: {reason}")]
    Unreachable { reason: String },
    #[error("queue not found: {queue}")]
    QueueNotFound { queue: String },
    #[error("queue {queue} is exclusive to another connection")]
    ResourceLocked { queue: String },
    #[error("channel or connection is closed")]
    Closed,
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Failure establishing a role's connection.
///
/// Except for `Closed`, the connection stays `Uninitialized` afterwards and a
/// later call may retry.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("broker unreachable after {attempts} attempt(s): {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("failed to set up {role} channels: {source}")]
    Setup {
        role: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("connection has been closed")]
    Closed,
}

/// Error returned to a caller waiting on a remote operation.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("no reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("request was cancelled")]
    Cancelled,
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,
    #[error("reply could not be decoded: {reason}")]
    MalformedReply { reason: String },
}
