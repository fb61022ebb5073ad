//! In-flight dispatch tracking so `close()` can let running handlers reply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct InFlight {
    count: Arc<AtomicU64>,
}

impl InFlight {
    /// Counts one dispatch until the returned guard is dropped.
    #[must_use]
    pub fn enter(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Waits until no dispatch is running, up to `timeout`. Returns `false`
    /// if some were still running at the deadline.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Decrements the counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_count() {
        let in_flight = InFlight::default();
        let a = in_flight.enter();
        let b = in_flight.enter();
        assert_eq!(in_flight.count(), 2);
        drop(a);
        drop(b);
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test]
    async fn drains_when_guards_drop() {
        let in_flight = InFlight::default();
        let guard = in_flight.enter();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        assert!(in_flight.wait_for_drain(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn drain_times_out() {
        let in_flight = InFlight::default();
        let _guard = in_flight.enter();
        assert!(!in_flight.wait_for_drain(Duration::from_millis(30)).await);
    }
}
