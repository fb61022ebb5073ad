//! Timeout middleware for operations.
//!
//! Fails requests that exceed their `call_timeout_ms` with `OperationError::Timeout`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use mqrpc_core::ResponseBody;
use tower::{Layer, Service};
use tracing::warn;

use crate::service::operation::{OperationError, OperationRequest};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing each request's own deadline.
///
/// The budget is `call_timeout_ms` on the request, so operations sharing one
/// pipeline can run under different limits.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<OperationRequest> for TimeoutService<S>
where
    S: Service<OperationRequest, Response = ResponseBody, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = ResponseBody;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<ResponseBody, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: OperationRequest) -> Self::Future {
        let timeout_ms = req.call_timeout_ms;
        let operation = req.operation.clone();
        let correlation_id = req.correlation_id.clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
                .await
                .unwrap_or_else(|_elapsed| {
                    warn!(%operation, %correlation_id, timeout_ms, "operation deadline exceeded");
                    Err(OperationError::Timeout { timeout_ms })
                })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
