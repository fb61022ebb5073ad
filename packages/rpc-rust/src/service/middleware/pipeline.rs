//! Pipeline composition: wraps the router with every middleware layer.

use mqrpc_core::ResponseBody;
use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::operation::{OperationError, OperationRequest};
use crate::service::router::OperationRouter;

/// Type-erased, cloneable operation pipeline.
///
/// `Sync` so it can sit inside a consumer role shared across tasks.
pub type OperationPipeline = BoxCloneSyncService<OperationRequest, ResponseBody, OperationError>;

/// Builds the operation pipeline around `router`.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded before doing any work
/// 2. `TimeoutLayer` -- enforce the request's deadline
/// 3. `MetricsLayer` -- record timing and outcome closest to the handler
///
/// Clones share the load-shed permits, so the limit holds across every
/// concurrently dispatched request.
#[must_use]
pub fn build_operation_pipeline(
    router: OperationRouter,
    max_concurrent_operations: u32,
) -> OperationPipeline {
    let service = ServiceBuilder::new()
        .layer(LoadShedLayer::new(max_concurrent_operations))
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(router);
    BoxCloneSyncService::new(service)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
