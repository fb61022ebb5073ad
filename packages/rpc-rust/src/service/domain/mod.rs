//! Built-in operation handlers.

use async_trait::async_trait;
use mqrpc_core::{ResponseBody, NOTIFY_SUCCESS_MESSAGE};
use serde_json::Value;
use tracing::info;

use crate::service::registry::OperationHandler;

/// `NOTIFY`: logs the payload and acknowledges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyHandler;

#[async_trait]
impl OperationHandler for NotifyHandler {
    async fn handle(&self, payload: Value) -> anyhow::Result<ResponseBody> {
        info!(%payload, "notification received");
        Ok(ResponseBody::success(NOTIFY_SUCCESS_MESSAGE))
    }
}
