//! Future resolving to the reply of one request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use mqrpc_core::{CorrelationId, ResponseBody};
use tokio::time::Sleep;

use super::pending::{PendingReplies, ReplySlot};
use crate::error::RpcError;
use crate::telemetry;

/// Awaits the reply to a request sent with [`RpcClient::send`].
///
/// Resolves to the reply body, or to `Timeout` once the request's deadline
/// passes, `Cancelled` after [`RpcClient::cancel`], `ConnectionClosed` if the
/// client closes first, or `MalformedReply` if the reply could not be
/// decoded. Dropping the handle before it resolves removes the pending entry.
///
/// [`RpcClient::send`]: super::RpcClient::send
/// [`RpcClient::cancel`]: super::RpcClient::cancel
#[must_use = "a reply handle does nothing unless awaited"]
pub struct ReplyHandle {
    correlation_id: CorrelationId,
    slot: ReplySlot,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    pending: Arc<PendingReplies>,
    done: bool,
}

impl ReplyHandle {
    pub(crate) fn new(
        correlation_id: CorrelationId,
        slot: ReplySlot,
        timeout: Duration,
        pending: Arc<PendingReplies>,
    ) -> Self {
        Self {
            correlation_id,
            slot,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timeout,
            pending,
            done: false,
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    fn timed_out(&self) -> RpcError {
        metrics::counter!(telemetry::REQUESTS_TIMED_OUT).increment(1);
        RpcError::Timeout {
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Future for ReplyHandle {
    type Output = Result<ResponseBody, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(outcome) = Pin::new(&mut this.slot).poll(cx) {
            this.done = true;
            // A dropped sender means the entry was evicted without an outcome.
            return Poll::Ready(outcome.unwrap_or(Err(RpcError::ConnectionClosed)));
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            this.done = true;
            if this.pending.remove(&this.correlation_id) {
                return Poll::Ready(Err(this.timed_out()));
            }
            // Someone else took the entry first; its outcome is already sent.
            return Poll::Ready(match this.slot.try_recv() {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::ConnectionClosed),
            });
        }

        Poll::Pending
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if !self.done {
            self.pending.remove(&self.correlation_id);
        }
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("correlation_id", &self.correlation_id)
            .field("timeout", &self.timeout)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
