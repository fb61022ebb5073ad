//! Operation routing: looks the operation tag up in the `HandlerRegistry`.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use mqrpc_core::ResponseBody;
use tower::Service;
use tracing::{debug, error};

use super::operation::{OperationError, OperationRequest};
use super::registry::HandlerRegistry;

type BoxedFuture = Pin<Box<dyn Future<Output = Result<ResponseBody, OperationError>> + Send>>;

// ---------------------------------------------------------------------------
// OperationRouter
// ---------------------------------------------------------------------------

/// Innermost service of the pipeline.
///
/// Unknown tags are answered with `"Invalid operation: <tag>"` as a normal
/// response, not an error. Handler errors and handler panics become
/// `OperationError::Internal`, so the caller still gets a reply.
#[derive(Debug, Clone)]
pub struct OperationRouter {
    registry: Arc<HandlerRegistry>,
}

impl OperationRouter {
    #[must_use]
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}

impl Default for OperationRouter {
    fn default() -> Self {
        Self::new(HandlerRegistry::with_builtins())
    }
}

impl Service<OperationRequest> for OperationRouter {
    type Response = ResponseBody;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: OperationRequest) -> Self::Future {
        let Some(handler) = self.registry.get(&req.operation) else {
            debug!(operation = %req.operation, correlation_id = %req.correlation_id, "unknown operation");
            let body = ResponseBody::invalid_operation(&req.operation);
            return Box::pin(async move { Ok(body) });
        };

        let operation = req.operation;
        Box::pin(async move {
            match AssertUnwindSafe(handler.handle(req.payload)).catch_unwind().await {
                Ok(result) => result.map_err(OperationError::Internal),
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(%operation, %reason, "handler panicked");
                    Err(OperationError::Internal(anyhow::anyhow!(
                        "handler panicked: {reason}"
                    )))
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use mqrpc_core::CorrelationId;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    fn request(operation: &str, payload: Value) -> OperationRequest {
        OperationRequest::new(operation, CorrelationId::generate(), payload, 5000)
    }

    #[tokio::test]
    async fn routes_notify_to_builtin() {
        let body = OperationRouter::default()
            .oneshot(request("NOTIFY", json!({})))
            .await
            .unwrap();
        assert!(body.success);
        assert_eq!(body.message, "Notification sent successfully.");
    }

    #[tokio::test]
    async fn unknown_operation_is_a_failure_body() {
        let body = OperationRouter::default()
            .oneshot(request("BOGUS", json!({})))
            .await
            .unwrap();
        assert!(!body.success);
        assert_eq!(body.message, "Invalid operation: BOGUS");
    }

    #[tokio::test]
    async fn empty_operation_is_invalid() {
        let body = OperationRouter::default()
            .oneshot(request("", Value::Null))
            .await
            .unwrap();
        assert_eq!(body.message, "Invalid operation: ");
    }

    #[tokio::test]
    async fn registered_handler_result_is_returned_verbatim() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("SUM", |payload| {
            let sum: i64 = payload["values"]
                .as_array()
                .map(|v| v.iter().filter_map(Value::as_i64).sum())
                .unwrap_or_default();
            ResponseBody::success("summed").with_result(json!(sum))
        });

        let body = OperationRouter::new(registry)
            .oneshot(request("SUM", json!({"values": [1, 2, 3]})))
            .await
            .unwrap();
        assert_eq!(body, ResponseBody::success("summed").with_result(json!(6)));
    }

    #[tokio::test]
    async fn handler_error_becomes_internal() {
        let mut registry = HandlerRegistry::new();
        registry.register_async("FAIL", |_| async { Err(anyhow::anyhow!("db down")) });

        let err = OperationRouter::new(registry)
            .oneshot(request("FAIL", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Internal(_)));
        assert_eq!(err.to_string(), "Internal error: db down");
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("BOOM", |_| panic!("handler bug"));
        registry.register_async("BOOM_LATER", |payload: Value| async move {
            tokio::task::yield_now().await;
            if payload.is_null() {
                panic!("{} failed", "async handler");
            }
            Ok(ResponseBody::success("unreachable"))
        });
        let router = OperationRouter::new(registry);

        let err = router
            .clone()
            .oneshot(request("BOOM", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Internal error: handler panicked: handler bug");

        let err = router
            .oneshot(request("BOOM_LATER", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Internal error: handler panicked: async handler failed"
        );
    }
}
