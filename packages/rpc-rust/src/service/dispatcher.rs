//! Runs decoded requests through the pipeline and hands the result to the
//! response producer.

use mqrpc_core::{CorrelationId, ResponseBody};
use serde_json::Value;
use tower::ServiceExt;
use tracing::{error, warn};

use super::middleware::{build_operation_pipeline, OperationPipeline};
use super::operation::OperationRequest;
use super::registry::HandlerRegistry;
use super::router::OperationRouter;
use crate::config::RpcConfig;
use crate::server::ResponseProducer;
use crate::telemetry;

/// Cheap to clone; clones share the pipeline's concurrency limit.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: OperationPipeline,
    operation_timeout_ms: u64,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: HandlerRegistry, config: &RpcConfig) -> Self {
        Self {
            pipeline: build_operation_pipeline(
                OperationRouter::new(registry),
                config.max_concurrent_operations,
            ),
            operation_timeout_ms: u64::try_from(config.operation_timeout.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Produces the reply body for one request. Never fails: pipeline errors
    /// are turned into failure bodies.
    pub async fn dispatch(
        &self,
        operation: String,
        correlation_id: CorrelationId,
        payload: Value,
    ) -> ResponseBody {
        let request =
            OperationRequest::new(operation, correlation_id, payload, self.operation_timeout_ms);
        let operation = request.operation.clone();
        let correlation_id = request.correlation_id.clone();

        match self.pipeline.clone().oneshot(request).await {
            Ok(body) => body,
            Err(e) => {
                metrics::counter!(telemetry::OPERATIONS_FAILED, "reason" => e.kind()).increment(1);
                warn!(%operation, %correlation_id, error = %e, "operation failed");
                e.into_response()
            }
        }
    }

    /// Dispatches the request and publishes the resulting body to `reply_to`
    /// stamped with `correlation_id`.
    pub async fn handle(
        &self,
        operation: String,
        reply_to: &str,
        correlation_id: CorrelationId,
        payload: Value,
        producer: &ResponseProducer,
    ) {
        let body = self.dispatch(operation, correlation_id.clone(), payload).await;
        if let Err(e) = producer.produce(reply_to, &correlation_id, &body).await {
            error!(%correlation_id, reply_to, error = %e, "failed to publish reply");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("operation_timeout_ms", &self.operation_timeout_ms)
            .finish_non_exhaustive()
    }
}
