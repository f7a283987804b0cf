use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use mu_core::Clock;

use crate::cron::schedule_next;
use crate::error::{ProgramError, Result};
use crate::types::{CronProgram, HeartbeatProgram, TickRecord, WakeStatus};

/// One wake handed to the host. The host turns it into a synthetic inbound
/// envelope (or coalesces it against in-flight work).
#[derive(Debug, Clone)]
pub struct WakeRequest {
    pub dedupe_key: String,
    pub program_id: String,
    pub title: String,
    pub kind: &'static str,
    pub prompt: Option<String>,
    pub target: Option<String>,
    pub metadata: serde_json::Value,
    pub scheduled_for_ms: i64,
}

#[async_trait]
pub trait WakeDispatcher: Send + Sync {
    async fn dispatch_wake(&self, wake: WakeRequest) -> WakeStatus;
}

// ── heartbeat programs ────────────────────────────────────────────────────────

struct HeartbeatInner {
    programs: HashMap<String, HeartbeatProgram>,
    next_fire: HashMap<String, i64>,
    last_tick: HashMap<String, TickRecord>,
}

/// Periodic wakes: each enabled program fires every `every_ms`, re-armed
/// from the tick that fired it. Disabled programs are dormant; enabling
/// re-arms from the next boundary.
pub struct HeartbeatProgramRegistry {
    inner: Mutex<HeartbeatInner>,
    dispatcher: Arc<dyn WakeDispatcher>,
    clock: Arc<dyn Clock>,
}

impl HeartbeatProgramRegistry {
    pub fn new(dispatcher: Arc<dyn WakeDispatcher>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HeartbeatInner {
                programs: HashMap::new(),
                next_fire: HashMap::new(),
                last_tick: HashMap::new(),
            }),
            dispatcher,
            clock,
        })
    }

    pub fn upsert(&self, program: HeartbeatProgram) -> Result<HeartbeatProgram> {
        if program.every_ms <= 0 {
            return Err(ProgramError::InvalidProgram(
                "every_ms must be positive".to_string(),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        if program.enabled {
            inner.next_fire.insert(
                program.program_id.clone(),
                self.clock.now_ms() + program.every_ms,
            );
        } else {
            inner.next_fire.remove(&program.program_id);
        }
        info!(program_id = %program.program_id, every_ms = program.every_ms, enabled = program.enabled, "heartbeat program upserted");
        inner
            .programs
            .insert(program.program_id.clone(), program.clone());
        Ok(program)
    }

    pub fn set_enabled(&self, program_id: &str, enabled: bool) -> Result<HeartbeatProgram> {
        let mut inner = self.inner.lock().unwrap();
        let program = inner
            .programs
            .get_mut(program_id)
            .ok_or_else(|| ProgramError::NotFound {
                program_id: program_id.to_string(),
            })?;
        program.enabled = enabled;
        let program = program.clone();
        if enabled {
            // Re-arm from the next boundary, not from the stale schedule.
            inner.next_fire.insert(
                program_id.to_string(),
                self.clock.now_ms() + program.every_ms,
            );
        } else {
            inner.next_fire.remove(program_id);
        }
        Ok(program)
    }

    pub fn remove(&self, program_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.programs.remove(program_id).is_none() {
            return Err(ProgramError::NotFound {
                program_id: program_id.to_string(),
            });
        }
        inner.next_fire.remove(program_id);
        inner.last_tick.remove(program_id);
        Ok(())
    }

    pub fn list(&self) -> Vec<HeartbeatProgram> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<HeartbeatProgram> = inner.programs.values().cloned().collect();
        out.sort_by(|a, b| a.program_id.cmp(&b.program_id));
        out
    }

    pub fn last_tick(&self, program_id: &str) -> Option<TickRecord> {
        self.inner.lock().unwrap().last_tick.get(program_id).cloned()
    }

    /// Fire every due program once. Returns the ticks that ran.
    pub async fn tick(&self) -> Vec<TickRecord> {
        let now = self.clock.now_ms();
        let due: Vec<(HeartbeatProgram, i64)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .next_fire
                .iter()
                .filter(|(_, at)| **at <= now)
                .filter_map(|(id, at)| inner.programs.get(id).map(|p| (p.clone(), *at)))
                .filter(|(p, _)| p.enabled)
                .collect()
        };

        let mut fired = Vec::new();
        for (program, scheduled_for_ms) in due {
            let wake = WakeRequest {
                dedupe_key: format!("heartbeat-program:{}", program.program_id),
                program_id: program.program_id.clone(),
                title: program.title.clone(),
                kind: "heartbeat",
                prompt: program.prompt.clone(),
                target: None,
                metadata: program.metadata.clone(),
                scheduled_for_ms,
            };
            let status = self.dispatcher.dispatch_wake(wake).await;
            if let WakeStatus::Failed { reason } = &status {
                warn!(program_id = %program.program_id, reason = %reason, "heartbeat wake failed");
            }
            let record = TickRecord {
                program_id: program.program_id.clone(),
                at_ms: now,
                status,
            };
            let mut inner = self.inner.lock().unwrap();
            inner
                .next_fire
                .insert(program.program_id.clone(), now + program.every_ms);
            inner
                .last_tick
                .insert(program.program_id.clone(), record.clone());
            fired.push(record);
        }
        fired
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("heartbeat registry started");
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = interval.tick() => { self.tick().await; }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat registry shutting down");
                        break;
                    }
                }
            }
        }
    }
}

// ── cron programs ─────────────────────────────────────────────────────────────

struct CronInner {
    programs: HashMap<String, CronProgram>,
    next_fire: HashMap<String, i64>,
    last_tick: HashMap<String, TickRecord>,
}

/// Absolute / anchored-interval / cron-expression wakes. A program whose
/// schedule is exhausted (one-shot `at` in the past) stays registered but
/// dormant.
pub struct CronProgramRegistry {
    inner: Mutex<CronInner>,
    dispatcher: Arc<dyn WakeDispatcher>,
    clock: Arc<dyn Clock>,
    horizon_minutes: u32,
}

impl CronProgramRegistry {
    pub fn new(
        dispatcher: Arc<dyn WakeDispatcher>,
        clock: Arc<dyn Clock>,
        horizon_minutes: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CronInner {
                programs: HashMap::new(),
                next_fire: HashMap::new(),
                last_tick: HashMap::new(),
            }),
            dispatcher,
            clock,
            horizon_minutes,
        })
    }

    pub fn upsert(&self, program: CronProgram) -> Result<CronProgram> {
        // Validate the schedule up front so a bad expression is a CRUD error,
        // not a silent never-fires.
        let next = schedule_next(&program.schedule, self.clock.now_ms(), self.horizon_minutes)?;
        let mut inner = self.inner.lock().unwrap();
        match (program.enabled, next) {
            (true, Some(at)) => {
                inner.next_fire.insert(program.program_id.clone(), at);
            }
            _ => {
                inner.next_fire.remove(&program.program_id);
            }
        }
        info!(program_id = %program.program_id, next = ?next, "cron program upserted");
        inner
            .programs
            .insert(program.program_id.clone(), program.clone());
        Ok(program)
    }

    pub fn set_enabled(&self, program_id: &str, enabled: bool) -> Result<CronProgram> {
        let program = {
            let mut inner = self.inner.lock().unwrap();
            let program = inner
                .programs
                .get_mut(program_id)
                .ok_or_else(|| ProgramError::NotFound {
                    program_id: program_id.to_string(),
                })?;
            program.enabled = enabled;
            program.clone()
        };
        if enabled {
            self.upsert(program.clone())?;
        } else {
            self.inner.lock().unwrap().next_fire.remove(program_id);
        }
        Ok(program)
    }

    pub fn remove(&self, program_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.programs.remove(program_id).is_none() {
            return Err(ProgramError::NotFound {
                program_id: program_id.to_string(),
            });
        }
        inner.next_fire.remove(program_id);
        inner.last_tick.remove(program_id);
        Ok(())
    }

    pub fn list(&self) -> Vec<CronProgram> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<CronProgram> = inner.programs.values().cloned().collect();
        out.sort_by(|a, b| a.program_id.cmp(&b.program_id));
        out
    }

    pub fn next_fire(&self, program_id: &str) -> Option<i64> {
        self.inner.lock().unwrap().next_fire.get(program_id).copied()
    }

    pub fn last_tick(&self, program_id: &str) -> Option<TickRecord> {
        self.inner.lock().unwrap().last_tick.get(program_id).cloned()
    }

    /// Fire every due program once and schedule its successor.
    pub async fn tick(&self) -> Vec<TickRecord> {
        let now = self.clock.now_ms();
        let due: Vec<(CronProgram, i64)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .next_fire
                .iter()
                .filter(|(_, at)| **at <= now)
                .filter_map(|(id, at)| inner.programs.get(id).map(|p| (p.clone(), *at)))
                .filter(|(p, _)| p.enabled)
                .collect()
        };

        let mut fired = Vec::new();
        for (program, scheduled_for_ms) in due {
            let wake = WakeRequest {
                dedupe_key: format!("cron-program:{}:{}", program.program_id, scheduled_for_ms),
                program_id: program.program_id.clone(),
                title: program.title.clone(),
                kind: "cron",
                prompt: None,
                target: Some(program.target.clone()),
                metadata: program.metadata.clone(),
                scheduled_for_ms,
            };
            let status = self.dispatcher.dispatch_wake(wake).await;
            debug!(program_id = %program.program_id, status = ?status, "cron_program.tick");

            // Strictly after the fire we just dispatched, or an on-boundary
            // `every` schedule would re-arm onto the same instant forever.
            let next = schedule_next(
                &program.schedule,
                scheduled_for_ms.max(now) + 1,
                self.horizon_minutes,
            )
            .ok()
            .flatten();
            let record = TickRecord {
                program_id: program.program_id.clone(),
                at_ms: now,
                status,
            };
            let mut inner = self.inner.lock().unwrap();
            match next {
                Some(at) => {
                    inner.next_fire.insert(program.program_id.clone(), at);
                }
                None => {
                    // One-shot exhausted — dormant from here on.
                    inner.next_fire.remove(&program.program_id);
                }
            }
            inner
                .last_tick
                .insert(program.program_id.clone(), record.clone());
            fired.push(record);
        }
        fired
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("cron registry started");
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = interval.tick() => { self.tick().await; }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cron registry shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CronSchedule;
    use mu_core::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingDispatcher {
        calls: AtomicU32,
        keys: Mutex<Vec<String>>,
    }

    impl RecordingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                keys: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WakeDispatcher for RecordingDispatcher {
        async fn dispatch_wake(&self, wake: WakeRequest) -> WakeStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.keys.lock().unwrap().push(wake.dedupe_key);
            WakeStatus::Ok
        }
    }

    fn heartbeat(id: &str, every_ms: i64, enabled: bool) -> HeartbeatProgram {
        HeartbeatProgram {
            program_id: id.to_string(),
            title: format!("hb {id}"),
            every_ms,
            enabled,
            reason: None,
            prompt: Some("check in".to_string()),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn heartbeat_fires_on_period_and_rearms() {
        let clock = ManualClock::at(0);
        let dispatcher = RecordingDispatcher::new();
        let registry = HeartbeatProgramRegistry::new(dispatcher.clone(), clock.clone());
        registry.upsert(heartbeat("hb-1", 1_000, true)).unwrap();

        assert!(registry.tick().await.is_empty());
        clock.set(1_000);
        let fired = registry.tick().await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].status, WakeStatus::Ok);
        assert_eq!(
            dispatcher.keys.lock().unwrap()[0],
            "heartbeat-program:hb-1"
        );

        // Re-armed for the next boundary, not immediately due again.
        assert!(registry.tick().await.is_empty());
        clock.set(2_000);
        assert_eq!(registry.tick().await.len(), 1);
    }

    #[tokio::test]
    async fn disabled_heartbeat_is_dormant_until_reenabled() {
        let clock = ManualClock::at(0);
        let dispatcher = RecordingDispatcher::new();
        let registry = HeartbeatProgramRegistry::new(dispatcher.clone(), clock.clone());
        registry.upsert(heartbeat("hb-1", 1_000, false)).unwrap();

        clock.set(5_000);
        assert!(registry.tick().await.is_empty());

        registry.set_enabled("hb-1", true).unwrap();
        // Re-armed from "now", so the next boundary is 6_000.
        clock.set(5_500);
        assert!(registry.tick().await.is_empty());
        clock.set(6_000);
        assert_eq!(registry.tick().await.len(), 1);
    }

    #[tokio::test]
    async fn cron_every_schedule_fires_and_reschedules() {
        let clock = ManualClock::at(0);
        let dispatcher = RecordingDispatcher::new();
        let registry = CronProgramRegistry::new(dispatcher.clone(), clock.clone(), 60);
        registry
            .upsert(CronProgram {
                program_id: "cp-1".to_string(),
                title: "sync".to_string(),
                schedule: CronSchedule::Every {
                    every_ms: 1_000,
                    anchor_ms: 0,
                },
                target: "status".to_string(),
                enabled: true,
                wake_mode: "now".to_string(),
                metadata: serde_json::json!({}),
            })
            .unwrap();

        // now == anchor, so the first boundary is due immediately.
        let next = registry.next_fire("cp-1").unwrap();
        assert_eq!(next, 0);
        let fired = registry.tick().await;
        assert_eq!(fired.len(), 1);
        assert!(dispatcher.keys.lock().unwrap()[0].starts_with("cron-program:cp-1:"));

        // Rescheduled onto the next boundary.
        assert_eq!(registry.next_fire("cp-1"), Some(1_000));
        clock.set(1_000);
        assert_eq!(registry.tick().await.len(), 1);
    }

    #[tokio::test]
    async fn cron_at_schedule_is_one_shot() {
        let clock = ManualClock::at(0);
        let dispatcher = RecordingDispatcher::new();
        let registry = CronProgramRegistry::new(dispatcher.clone(), clock.clone(), 60);
        registry
            .upsert(CronProgram {
                program_id: "once".to_string(),
                title: "once".to_string(),
                schedule: CronSchedule::At { at_ms: 500 },
                target: "status".to_string(),
                enabled: true,
                wake_mode: "now".to_string(),
                metadata: serde_json::json!({}),
            })
            .unwrap();

        clock.set(600);
        assert_eq!(registry.tick().await.len(), 1);
        assert_eq!(registry.next_fire("once"), None);
        clock.set(10_000);
        assert!(registry.tick().await.is_empty());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_cron_program_is_rejected_at_upsert() {
        let clock = ManualClock::at(0);
        let registry = CronProgramRegistry::new(RecordingDispatcher::new(), clock, 60);
        let err = registry
            .upsert(CronProgram {
                program_id: "bad".to_string(),
                title: "bad".to_string(),
                schedule: CronSchedule::Cron {
                    expr: "not a cron".to_string(),
                    tz: None,
                },
                target: "status".to_string(),
                enabled: true,
                wake_mode: "now".to_string(),
                metadata: serde_json::json!({}),
            })
            .unwrap_err();
        assert_eq!(err.code(), "cron_expr_invalid");
    }
}
