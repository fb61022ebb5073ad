//! Operation request and error types flowing through the server pipeline.

use mqrpc_core::{CorrelationId, ResponseBody};
use serde_json::Value;

/// A decoded request on its way to a handler.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Operation tag from the `operation` header. Empty when the header was absent.
    pub operation: String,
    pub correlation_id: CorrelationId,
    pub payload: Value,
    /// Deadline enforced by the timeout layer.
    pub call_timeout_ms: u64,
}

impl OperationRequest {
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        correlation_id: CorrelationId,
        payload: Value,
        call_timeout_ms: u64,
    ) -> Self {
        Self {
            operation: operation.into(),
            correlation_id,
            payload,
            call_timeout_ms,
        }
    }
}

/// Errors raised inside the pipeline. Each one still produces a reply.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("Server overloaded, try again later")]
    Overloaded,
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    /// Failure body sent back to the caller.
    #[must_use]
    pub fn into_response(self) -> ResponseBody {
        ResponseBody::failure(self.to_string())
    }

    /// Short label used for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Overloaded => "overloaded",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_as_failure_bodies() {
        let body = OperationError::Overloaded.into_response();
        assert!(!body.success);
        assert_eq!(body.message, "Server overloaded, try again later");

        let body = OperationError::Timeout { timeout_ms: 250 }.into_response();
        assert_eq!(body.message, "Operation timed out after 250ms");

        let body = OperationError::from(anyhow::anyhow!("disk full")).into_response();
        assert_eq!(body.message, "Internal error: disk full");
    }

    #[test]
    fn error_kinds() {
        assert_eq!(OperationError::Overloaded.kind(), "overloaded");
        assert_eq!(OperationError::Timeout { timeout_ms: 1 }.kind(), "timeout");
    }
}
