use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use mu_core::config::OutboxConfig;
use mu_core::Clock;
use mu_journal::SerializedMutationExecutor;

use crate::store::OutboxStore;
use crate::types::{DeliveryOutcome, EnvelopeKind, OutboundEnvelope, OutboxState};

/// Transport seam. The gateway wires one implementation per deployment;
/// tests substitute scripted outcomes.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, envelope: &OutboundEnvelope) -> DeliveryOutcome;
}

/// Leases due records, attempts delivery, applies retry-with-backoff, and
/// dead-letters exhausted records. Store mutations run inside the serialized
/// lane; the delivery call itself runs outside it.
pub struct OutboxDispatcher {
    store: Arc<Mutex<OutboxStore>>,
    lane: Arc<SerializedMutationExecutor>,
    deliverer: Arc<dyn Deliverer>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    delivered_total: AtomicU64,
    retried_total: AtomicU64,
    dead_lettered_total: AtomicU64,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<Mutex<OutboxStore>>,
        lane: Arc<SerializedMutationExecutor>,
        deliverer: Arc<dyn Deliverer>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            lane,
            deliverer,
            clock,
            config,
            delivered_total: AtomicU64::new(0),
            retried_total: AtomicU64::new(0),
            dead_lettered_total: AtomicU64::new(0),
        })
    }

    /// Default attempt budget for `kind` when the enqueuer does not pick one.
    pub fn max_attempts_for(&self, kind: EnvelopeKind) -> u32 {
        match kind {
            EnvelopeKind::Ack => self.config.max_attempts_ack,
            EnvelopeKind::Lifecycle => self.config.max_attempts_lifecycle,
            EnvelopeKind::Result => self.config.max_attempts_result,
            EnvelopeKind::Error => self.config.max_attempts_error,
        }
    }

    /// One drain pass. Returns how many records were attempted.
    pub async fn drain_due(&self) -> usize {
        let now = self.clock.now_ms();
        let due = {
            let store = self.store.clone();
            self.lane
                .run(|| async move { store.lock().unwrap().due(now) })
                .await
        };
        if due.is_empty() {
            return 0;
        }
        debug!(count = due.len(), "draining due outbox records");

        let attempted = due.len();
        for record in due {
            let outcome = match tokio::time::timeout(
                Duration::from_millis(self.config.delivery_timeout_ms),
                self.deliverer.deliver(&record.envelope),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::Retry {
                    error: format!(
                        "delivery timed out after {}ms",
                        self.config.delivery_timeout_ms
                    ),
                    retry_delay_ms: None,
                },
            };

            let outbox_id = record.outbox_id.0.clone();
            let attempt_count = record.attempt_count;
            let now = self.clock.now_ms();
            let store = self.store.clone();
            let apply = match outcome {
                DeliveryOutcome::Delivered => {
                    self.delivered_total.fetch_add(1, Ordering::Relaxed);
                    info!(outbox_id = %outbox_id, "outbox delivered");
                    self.lane
                        .run(|| async move {
                            store
                                .lock()
                                .unwrap()
                                .mark_delivered(&outbox_id, attempt_count + 1)
                                .map(|_| None::<crate::types::OutboxRecord>)
                        })
                        .await
                }
                DeliveryOutcome::Retry { error, retry_delay_ms } => {
                    self.retried_total.fetch_add(1, Ordering::Relaxed);
                    let delay =
                        retry_delay_ms.unwrap_or_else(|| self.backoff_delay(attempt_count));
                    warn!(outbox_id = %outbox_id, error = %error, delay_ms = delay, "delivery failed, retrying");
                    self.lane
                        .run(|| async move {
                            store
                                .lock()
                                .unwrap()
                                .mark_retry(&outbox_id, &error, now + delay)
                                .map(Some)
                        })
                        .await
                }
                DeliveryOutcome::Drop { reason } => {
                    warn!(outbox_id = %outbox_id, reason = %reason, "delivery dropped");
                    self.lane
                        .run(|| async move {
                            store.lock().unwrap().mark_dropped(&outbox_id, &reason).map(Some)
                        })
                        .await
                }
            };

            match apply {
                Ok(Some(updated)) if updated.state == OutboxState::DeadLetter => {
                    self.dead_lettered_total.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to persist outbox outcome"),
            }
        }
        attempted
    }

    /// Dispatcher loop: poll for due work until shutdown flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(poll_ms = self.config.poll_interval_ms, "outbox dispatcher started");
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(10)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_due().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("outbox dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Exponential backoff with ±20% jitter, capped.
    fn backoff_delay(&self, attempt_count: u32) -> i64 {
        let base = self.config.backoff_base_ms.max(1);
        let exp = base.saturating_mul(1_i64 << attempt_count.min(20));
        let capped = exp.min(self.config.backoff_cap_ms.max(base));
        let jitter: f64 = rand::rng().random_range(0.8..1.2);
        ((capped as f64) * jitter) as i64
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.delivered_total.load(Ordering::Relaxed),
            self.retried_total.load(Ordering::Relaxed),
            self.dead_lettered_total.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::types::Correlation;
    use mu_core::{Channel, ManualClock};
    use std::collections::VecDeque;

    struct ScriptedDeliverer {
        outcomes: Mutex<VecDeque<DeliveryOutcome>>,
    }

    #[async_trait]
    impl Deliverer for ScriptedDeliverer {
        async fn deliver(&self, _envelope: &OutboundEnvelope) -> DeliveryOutcome {
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DeliveryOutcome::Delivered)
        }
    }

    fn envelope() -> OutboundEnvelope {
        OutboundEnvelope {
            channel: Channel::Slack,
            channel_tenant_id: "T1".into(),
            channel_conversation_id: "C1".into(),
            kind: EnvelopeKind::Result,
            body: "status · completed".into(),
            correlation: Correlation::default(),
            metadata: serde_json::json!({}),
        }
    }

    fn dispatcher(
        dir: &std::path::Path,
        outcomes: Vec<DeliveryOutcome>,
        clock: Arc<ManualClock>,
    ) -> (Arc<OutboxDispatcher>, Arc<Mutex<OutboxStore>>) {
        let store = Arc::new(Mutex::new(OutboxStore::open(dir).unwrap()));
        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            SerializedMutationExecutor::new(),
            Arc::new(ScriptedDeliverer {
                outcomes: Mutex::new(outcomes.into()),
            }),
            clock,
            OutboxConfig::default(),
        );
        (dispatcher, store)
    }

    #[tokio::test]
    async fn delivers_due_records() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(0);
        let (dispatcher, store) = dispatcher(dir.path(), vec![], clock.clone());

        let id = store
            .lock()
            .unwrap()
            .enqueue(envelope(), "k1", 3, 0)
            .unwrap()
            .outbox_id
            .0;
        assert_eq!(dispatcher.drain_due().await, 1);
        assert_eq!(
            store.lock().unwrap().get(&id).unwrap().state,
            OutboxState::Delivered
        );
        assert_eq!(dispatcher.counters().0, 1);
    }

    #[tokio::test]
    async fn retry_then_dead_letter_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(0);
        let (dispatcher, store) = dispatcher(
            dir.path(),
            vec![
                DeliveryOutcome::Retry { error: "503".into(), retry_delay_ms: Some(10) },
                DeliveryOutcome::Retry { error: "503".into(), retry_delay_ms: Some(10) },
                DeliveryOutcome::Retry { error: "503".into(), retry_delay_ms: Some(10) },
            ],
            clock.clone(),
        );

        let id = store
            .lock()
            .unwrap()
            .enqueue(envelope(), "k1", 3, 0)
            .unwrap()
            .outbox_id
            .0;

        for _ in 0..3 {
            dispatcher.drain_due().await;
            clock.advance(50);
        }
        let record = store.lock().unwrap().get(&id).cloned().unwrap();
        assert_eq!(record.state, OutboxState::DeadLetter);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(dispatcher.counters().2, 1);
    }

    #[tokio::test]
    async fn drop_goes_straight_to_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(0);
        let (dispatcher, store) = dispatcher(
            dir.path(),
            vec![DeliveryOutcome::Drop { reason: "bad channel".into() }],
            clock,
        );
        let id = store
            .lock()
            .unwrap()
            .enqueue(envelope(), "k1", 5, 0)
            .unwrap()
            .outbox_id
            .0;
        dispatcher.drain_due().await;
        let record = store.lock().unwrap().get(&id).cloned().unwrap();
        assert_eq!(record.state, OutboxState::DeadLetter);
        assert_eq!(record.last_error.as_deref(), Some("bad channel"));
    }

    #[tokio::test]
    async fn not_due_records_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(0);
        let (dispatcher, store) = dispatcher(dir.path(), vec![], clock);
        store
            .lock()
            .unwrap()
            .enqueue(envelope(), "k1", 3, 500)
            .unwrap();
        assert_eq!(dispatcher.drain_due().await, 0);
    }
}
