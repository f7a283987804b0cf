//! The single serialized mutation lane. Every mutation that touches the
//! journal, the idempotency ledger, the outbox store, or policy counters
//! runs through [`SerializedMutationExecutor::run`] — strict FIFO, one at a
//! time, never re-entrant.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// FIFO single-slot queue. Built on a tokio mutex, whose acquisition order
/// is fair, so callers run in arrival order.
#[derive(Default)]
pub struct SerializedMutationExecutor {
    slot: Mutex<()>,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl SerializedMutationExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `f` once the slot frees. Do not call `run` from inside `f` — the
    /// lane is not re-entrant and the inner call would deadlock.
    pub async fn run<T, F, Fut>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.slot.lock().await;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let out = f().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }

    /// High-water mark of concurrent executions. Stays at 1 when the lane
    /// is doing its job; tests assert on it.
    pub fn max_observed_concurrency(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn mutations_never_overlap() {
        let lane = SerializedMutationExecutor::new();
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lane = lane.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                lane.run(|| async {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert_eq!(lane.max_observed_concurrency(), 1);
    }

    #[tokio::test]
    async fn run_returns_the_closure_value() {
        let lane = SerializedMutationExecutor::new();
        let out = lane.run(|| async { 41 + 1 }).await;
        assert_eq!(out, 42);
    }
}
