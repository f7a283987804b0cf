//! Generation-scoped reload: blue/green swap of the adapter set. Warm the
//! next generation, atomically switch the route map, then drain the old
//! generation's in-flight handlers within a bounded window.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use mu_adapters::AdapterSet;
use mu_core::config::AdaptersConfig;
use mu_core::Clock;

use crate::telemetry::Telemetry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationIdentity {
    pub generation_id: String,
    pub generation_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadState {
    Planned,
    Swapped,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackInfo {
    pub trigger: String,
    pub attempted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrainStats {
    pub duration_ms: u64,
    pub forced_stop: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadAttempt {
    pub attempt_id: String,
    pub reason: String,
    pub state: ReloadState,
    pub planned_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swapped_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_generation: Option<String>,
    pub to_generation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Injection points for warmup/cutover checks. The default hooks accept
/// everything; tests inject failures to exercise rollback.
pub trait GenerationHooks: Send + Sync {
    fn on_warmup(&self, _next: &AdapterSet) -> Result<(), String> {
        Ok(())
    }
    fn on_cutover(&self) -> Result<(), String> {
        Ok(())
    }
}

struct AcceptAll;
impl GenerationHooks for AcceptAll {}

/// RAII guard counting an in-flight inbound handler. Holders keep their
/// generation's `Arc<AdapterSet>` until completion, so a swap never pulls
/// verification state out from under a live request.
pub struct InFlightGuard {
    gauge: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct GenerationSupervisor {
    adapters: RwLock<Arc<AdapterSet>>,
    previous: Mutex<Option<(Arc<AdapterSet>, GenerationIdentity)>>,
    generation: Mutex<GenerationIdentity>,
    last_reload: Mutex<Option<ReloadAttempt>>,
    in_flight: Arc<AtomicU64>,
    hooks: Mutex<Arc<dyn GenerationHooks>>,
    telemetry: Arc<Telemetry>,
    clock: Arc<dyn Clock>,
    drain_timeout_ms: u64,
}

impl GenerationSupervisor {
    pub fn new(
        initial: AdapterSet,
        telemetry: Arc<Telemetry>,
        clock: Arc<dyn Clock>,
        drain_timeout_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapters: RwLock::new(Arc::new(initial)),
            previous: Mutex::new(None),
            generation: Mutex::new(GenerationIdentity {
                generation_id: new_generation_id(),
                generation_seq: 1,
            }),
            last_reload: Mutex::new(None),
            in_flight: Arc::new(AtomicU64::new(0)),
            hooks: Mutex::new(Arc::new(AcceptAll)),
            telemetry,
            clock,
            drain_timeout_ms,
        })
    }

    pub fn set_hooks(&self, hooks: Arc<dyn GenerationHooks>) {
        *self.hooks.lock().unwrap() = hooks;
    }

    /// Current adapter set. Callers clone the Arc and may keep it across
    /// awaits; a concurrent swap does not affect them.
    pub fn current(&self) -> Arc<AdapterSet> {
        self.adapters.read().unwrap().clone()
    }

    pub fn generation(&self) -> GenerationIdentity {
        self.generation.lock().unwrap().clone()
    }

    pub fn last_reload(&self) -> Option<ReloadAttempt> {
        self.last_reload.lock().unwrap().clone()
    }

    /// Track one inbound handler for drain accounting.
    pub fn begin_request(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            gauge: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Full reload: warm → cutover → drain. Returns the attempt record
    /// whatever happened; `state == Failed` means the old generation still
    /// serves.
    pub async fn reload(&self, next_adapters: &AdaptersConfig, reason: &str) -> ReloadAttempt {
        let now = self.clock.now_ms();
        let from = self.generation();
        let mut attempt = ReloadAttempt {
            attempt_id: format!("reload-{}", Uuid::new_v4()),
            reason: reason.to_string(),
            state: ReloadState::Planned,
            planned_at_ms: now,
            swapped_at_ms: None,
            finished_at_ms: None,
            from_generation: Some(from.generation_id.clone()),
            to_generation: new_generation_id(),
            rollback: None,
            drain: None,
            error: None,
        };
        info!(attempt_id = %attempt.attempt_id, reason, "reload planned");

        let hooks = self.hooks.lock().unwrap().clone();

        // Warmup: build and readiness-check the new generation without
        // touching the live map.
        let next = AdapterSet::from_config(next_adapters);
        if let Err(e) = hooks.on_warmup(&next) {
            warn!(error = %e, "reload warmup failed; no cutover performed");
            attempt.state = ReloadState::Failed;
            attempt.error = Some(e);
            attempt.rollback = Some(RollbackInfo {
                trigger: "warmup_failed".to_string(),
                attempted: false,
            });
            attempt.finished_at_ms = Some(self.clock.now_ms());
            self.finish(attempt.clone(), false);
            return attempt;
        }

        // Cutover: swap the route map, then give the hook a chance to veto.
        let next = Arc::new(next);
        let prev = {
            let mut guard = self.adapters.write().unwrap();
            let prev = guard.clone();
            *guard = next.clone();
            prev
        };
        if let Err(e) = hooks.on_cutover() {
            error!(error = %e, "cutover failed; restoring prior adapter map");
            *self.adapters.write().unwrap() = prev;
            attempt.state = ReloadState::Failed;
            attempt.error = Some(e);
            attempt.rollback = Some(RollbackInfo {
                trigger: "cutover_failed".to_string(),
                attempted: true,
            });
            attempt.finished_at_ms = Some(self.clock.now_ms());
            self.finish(attempt.clone(), false);
            return attempt;
        }

        let to_generation = {
            let mut generation = self.generation.lock().unwrap();
            *self.previous.lock().unwrap() = Some((prev, generation.clone()));
            *generation = GenerationIdentity {
                generation_id: attempt.to_generation.clone(),
                generation_seq: generation.generation_seq + 1,
            };
            generation.clone()
        };
        attempt.state = ReloadState::Swapped;
        attempt.swapped_at_ms = Some(self.clock.now_ms());
        info!(generation = %to_generation.generation_id, seq = to_generation.generation_seq, "cutover complete");

        // Drain the old generation within a bounded window.
        let drain_started = std::time::Instant::now();
        let mut forced_stop = false;
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            if drain_started.elapsed() >= Duration::from_millis(self.drain_timeout_ms) {
                warn!(in_flight = self.in_flight(), "drain window elapsed; forcing stop of old generation");
                forced_stop = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let duration_ms = drain_started.elapsed().as_millis() as u64;
        self.telemetry
            .reload_drain_duration_ms_total
            .fetch_add(duration_ms, Ordering::Relaxed);
        attempt.drain = Some(DrainStats {
            duration_ms,
            forced_stop,
        });
        attempt.state = ReloadState::Completed;
        attempt.finished_at_ms = Some(self.clock.now_ms());
        self.finish(attempt.clone(), true);
        attempt
    }

    /// Manual rollback to the previous generation, if one is retained.
    pub fn rollback_manual(&self) -> Result<ReloadAttempt, String> {
        let Some((prev_set, prev_generation)) = self.previous.lock().unwrap().take() else {
            return Err("no previous generation to roll back to".to_string());
        };
        let now = self.clock.now_ms();
        let from = self.generation();

        *self.adapters.write().unwrap() = prev_set;
        let to_generation = {
            let mut generation = self.generation.lock().unwrap();
            *generation = GenerationIdentity {
                generation_id: prev_generation.generation_id.clone(),
                generation_seq: generation.generation_seq + 1,
            };
            generation.clone()
        };
        info!(generation = %to_generation.generation_id, "manual rollback applied");

        let attempt = ReloadAttempt {
            attempt_id: format!("reload-{}", Uuid::new_v4()),
            reason: "manual rollback".to_string(),
            state: ReloadState::Completed,
            planned_at_ms: now,
            swapped_at_ms: Some(now),
            finished_at_ms: Some(self.clock.now_ms()),
            from_generation: Some(from.generation_id),
            to_generation: to_generation.generation_id,
            rollback: Some(RollbackInfo {
                trigger: "manual".to_string(),
                attempted: true,
            }),
            drain: None,
            error: None,
        };
        self.finish(attempt.clone(), true);
        Ok(attempt)
    }

    fn finish(&self, attempt: ReloadAttempt, success: bool) {
        if success {
            self.telemetry
                .reload_success_total
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.telemetry
                .reload_failure_total
                .fetch_add(1, Ordering::Relaxed);
        }
        *self.last_reload.lock().unwrap() = Some(attempt);
    }
}

fn new_generation_id() -> String {
    format!("gen-{}", Uuid::now_v7())
}
