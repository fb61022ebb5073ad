//! Load-shedding middleware for operations.
//!
//! Rejects requests with `OperationError::Overloaded` once the number of
//! in-flight handler invocations reaches `max_concurrent_operations`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use mqrpc_core::ResponseBody;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::service::operation::{OperationError, OperationRequest};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent requests via a semaphore.
///
/// When all permits are taken, requests are rejected immediately rather than
/// queued. Services produced by one layer share its permits.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> LoadShedService<S> {
    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Service<OperationRequest> for LoadShedService<S>
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
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return Box::pin(async { Err(OperationError::Overloaded) });
        };

        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mqrpc_core::CorrelationId;
    use serde_json::Value;
    use tower::{service_fn, ServiceExt};

    use super::*;

    async fn hold_permit(_req: OperationRequest) -> Result<ResponseBody, OperationError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ResponseBody::success("done"))
    }

    fn request() -> OperationRequest {
        OperationRequest::new("OP", CorrelationId::generate(), Value::Null, 5000)
    }

    #[tokio::test]
    async fn sheds_while_limit_is_held_and_recovers() {
        let mut svc = LoadShedLayer::new(1).layer(service_fn(hold_permit));

        // The permit is taken when `call` runs, before the future is polled.
        let in_flight = svc.call(request());
        assert_eq!(svc.available(), 0);
        let err = svc.call(request()).await.unwrap_err();
        assert_eq!(err.to_string(), "Server overloaded, try again later");

        assert!(in_flight.await.unwrap().success);
        assert_eq!(svc.available(), 1);
        assert!(svc.oneshot(request()).await.is_ok());
    }

    #[tokio::test]
    async fn services_from_one_layer_share_permits() {
        let layer = LoadShedLayer::new(1);
        let mut first = layer.layer(service_fn(hold_permit));
        let mut second = layer.layer(service_fn(hold_permit));

        let in_flight = first.call(request());
        let err = second.call(request()).await.unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));
        drop(in_flight);
        assert_eq!(second.available(), 1);
    }
}
