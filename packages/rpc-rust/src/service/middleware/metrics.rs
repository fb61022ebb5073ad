//! Metrics middleware for operations.
//!
//! Wraps each handler call in an `operation` span and records its outcome
//! and duration through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use mqrpc_core::ResponseBody;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{OperationError, OperationRequest};
use crate::telemetry;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records operation duration and outcome (`ok`, `failure` or `error`).
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<OperationRequest> for MetricsService<S>
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
        let operation = req.operation.clone();
        let span = info_span!(
            "operation",
            operation = %operation,
            correlation_id = %req.correlation_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(body) if body.success => "ok",
                    Ok(_) => "failure",
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(
                    telemetry::OPERATIONS,
                    "operation" => operation.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(telemetry::OPERATION_DURATION, "operation" => operation)
                    .record(elapsed.as_secs_f64());

                tracing::debug!(duration_ms, outcome, "operation complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
