//! Registry of requests waiting for a reply.
//!
//! Each entry owns the one-shot sender of its caller. Every way out of the
//! map (resolve, fail, expire, remove) takes the entry, so a correlation id is
//! completed at most once and a late duplicate finds nothing.

use std::time::Duration;

use dashmap::DashMap;
use mqrpc_core::{CorrelationId, ResponseBody};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RpcError;
use crate::telemetry;

pub(crate) type ReplySlot = oneshot::Receiver<Result<ResponseBody, RpcError>>;

struct PendingRequest {
    tx: oneshot::Sender<Result<ResponseBody, RpcError>>,
    operation: String,
    deadline: Instant,
    timeout: Duration,
}

#[derive(Default)]
pub struct PendingReplies {
    entries: DashMap<CorrelationId, PendingRequest>,
}

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, clamped so a huge timeout such as `Duration::MAX` waits
/// indefinitely instead of overflowing.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

impl PendingReplies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry expiring `timeout` from now and returns its receiver.
    /// An existing entry with the same id is replaced and its caller dropped.
    pub(crate) fn register(
        &self,
        id: CorrelationId,
        operation: &str,
        timeout: Duration,
    ) -> ReplySlot {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingRequest {
                tx,
                operation: operation.to_string(),
                deadline: deadline_after(timeout),
                timeout,
            },
        );
        rx
    }

    /// Completes the entry for `id` with `body`. Returns `false` when no entry
    /// exists (unmatched or duplicate reply).
    pub fn resolve(&self, id: &CorrelationId, body: ResponseBody) -> bool {
        self.complete(id, Ok(body))
    }

    /// Completes the entry for `id` with an error.
    pub fn fail(&self, id: &CorrelationId, error: RpcError) -> bool {
        self.complete(id, Err(error))
    }

    /// Drops the entry without notifying anyone.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fails every entry whose deadline is at or before `now` with
    /// `RpcError::Timeout`. Returns how many expired.
    pub fn expire(&self, now: Instant) -> usize {
        let candidates: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for id in candidates {
            let Some((id, entry)) = self.entries.remove_if(&id, |_, e| e.deadline <= now) else {
                continue;
            };
            let timeout_ms = u64::try_from(entry.timeout.as_millis()).unwrap_or(u64::MAX);
            debug!(correlation_id = %id, operation = %entry.operation, timeout_ms, "request timed out");
            let _ = entry.tx.send(Err(RpcError::Timeout { timeout_ms }));
            expired += 1;
        }
        if expired > 0 {
            metrics::counter!(telemetry::REQUESTS_TIMED_OUT).increment(expired as u64);
        }
        expired
    }

    /// Fails every entry with the error built by `make_error`.
    pub fn fail_all(&self, make_error: impl Fn() -> RpcError) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter(|id| self.fail(id, make_error()))
            .count()
    }

    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn complete(&self, id: &CorrelationId, outcome: Result<ResponseBody, RpcError>) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                // The caller may have gone away; the entry is gone either way.
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn resolve_delivers_body_once() {
        let pending = PendingReplies::new();
        let id = CorrelationId::generate();
        let rx = pending.register(id.clone(), "NOTIFY", LONG);

        assert!(pending.resolve(&id, ResponseBody::success("ok")));
        assert!(!pending.resolve(&id, ResponseBody::success("again")));

        let body = rx.await.unwrap().unwrap();
        assert_eq!(body.message, "ok");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn resolving_one_leaves_others() {
        let pending = PendingReplies::new();
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        let _rx_a = pending.register(a.clone(), "A", LONG);
        let mut rx_b = pending.register(b.clone(), "B", LONG);

        pending.resolve(&a, ResponseBody::success("a"));

        assert!(pending.contains(&b));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_not_resolved() {
        let pending = PendingReplies::new();
        assert!(!pending.resolve(&CorrelationId::from("nope"), ResponseBody::success("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_only_fails_overdue_entries() {
        let pending = PendingReplies::new();
        let short = CorrelationId::generate();
        let long = CorrelationId::generate();
        let rx_short = pending.register(short.clone(), "SHORT", Duration::from_millis(100));
        let _rx_long = pending.register(long.clone(), "LONG", LONG);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(pending.expire(Instant::now()), 1);

        let err = rx_short.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Timeout { timeout_ms: 100 }));
        assert!(!pending.contains(&short));
        assert!(pending.contains(&long));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_never_expires() {
        let pending = PendingReplies::new();
        let id = CorrelationId::generate();
        let rx = pending.register(id.clone(), "WAIT", Duration::MAX);

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(pending.expire(Instant::now()), 0);

        assert!(pending.resolve(&id, ResponseBody::success("late")));
        assert_eq!(rx.await.unwrap().unwrap().message, "late");
    }

    #[tokio::test]
    async fn fail_all_drains_registry() {
        let pending = PendingReplies::new();
        let receivers: Vec<_> = (0..3)
            .map(|_| pending.register(CorrelationId::generate(), "OP", LONG))
            .collect();

        assert_eq!(pending.fail_all(|| RpcError::ConnectionClosed), 3);
        assert!(pending.is_empty());
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(RpcError::ConnectionClosed)));
        }
    }

    #[tokio::test]
    async fn remove_drops_without_notification() {
        let pending = PendingReplies::new();
        let id = CorrelationId::generate();
        let rx = pending.register(id.clone(), "OP", LONG);
        assert!(pending.remove(&id));
        assert!(rx.await.is_err());
    }
}
