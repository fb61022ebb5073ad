//! Background sweep of expired pending requests.
//!
//! Handles enforce their own deadline while awaited. The reaper covers
//! requests whose handle is not being polled, so overdue entries never linger.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::pending::PendingReplies;
use crate::service::worker::BackgroundRunnable;

#[derive(Debug)]
pub enum ReaperTask {
    /// Sweep now instead of waiting for the next tick.
    Sweep,
}

pub struct PendingReaper {
    pending: Arc<PendingReplies>,
}

impl PendingReaper {
    #[must_use]
    pub fn new(pending: Arc<PendingReplies>) -> Self {
        Self { pending }
    }

    fn sweep(&self) {
        let expired = self.pending.expire(Instant::now());
        if expired > 0 {
            debug!(expired, remaining = self.pending.len(), "reaped expired requests");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for PendingReaper {
    type Task = ReaperTask;

    fn name(&self) -> &'static str {
        "pending-reaper"
    }

    async fn run(&mut self, task: ReaperTask) {
        match task {
            ReaperTask::Sweep => self.sweep(),
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mqrpc_core::CorrelationId;

    use super::*;
    use crate::error::RpcError;
    use crate::service::worker::BackgroundWorker;

    #[tokio::test]
    async fn tick_expires_unpolled_requests() {
        let pending = Arc::new(PendingReplies::new());
        let rx = pending.register(CorrelationId::generate(), "OP", Duration::from_millis(10));

        let mut worker = BackgroundWorker::start(
            PendingReaper::new(Arc::clone(&pending)),
            Duration::from_millis(10),
        );
        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("reaper did not fire")
            .unwrap();
        worker.stop().await;

        assert!(matches!(outcome, Err(RpcError::Timeout { timeout_ms: 10 })));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn sweep_task_runs_on_demand() {
        let pending = Arc::new(PendingReplies::new());
        let _rx = pending.register(CorrelationId::generate(), "OP", Duration::ZERO);

        let mut worker = BackgroundWorker::start(
            PendingReaper::new(Arc::clone(&pending)),
            Duration::from_secs(3600),
        );
        worker.submit(ReaperTask::Sweep).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert!(pending.is_empty());
    }
}
