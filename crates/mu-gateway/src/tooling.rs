//! Operator tooling: the façade over journal/outbox/policy used by the DLQ
//! and audit surfaces, plus the admin command handlers the pipeline routes
//! `audit get`, `dlq *`, `kill-switch set`, `rate-limit override`,
//! `policy update`, `status`, `ready`, and the run triggers to.
//!
//! The façade is constructed after the pipeline and outbox exist, which is
//! what breaks the pipeline ↔ dispatcher reference cycle.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use mu_core::config::OverflowBehavior;
use mu_core::{Clock, CommandRecord};
use mu_journal::{CommandJournal, JournalEntry, SerializedMutationExecutor, WriterLock};
use mu_outbox::{OutboxRecord, OutboxStore};
use mu_pipeline::{CommandHandler, HandlerOutcome, PipelineCounters, ReplayMutationEvent};
use mu_policy::{KillSwitchTarget, PolicyEngine, PolicySet, RateLimitPolicy};
use mu_runs::{LaunchOptions, RunRoute, RunSupervisor};

use crate::generation::GenerationSupervisor;
use crate::telemetry::{GateThresholds, Telemetry};

pub struct OperatorTooling {
    journal: Arc<Mutex<CommandJournal>>,
    outbox: Arc<Mutex<OutboxStore>>,
    policy: Arc<Mutex<PolicyEngine>>,
    lane: Arc<SerializedMutationExecutor>,
    clock: Arc<dyn Clock>,
}

impl OperatorTooling {
    pub fn new(
        journal: Arc<Mutex<CommandJournal>>,
        outbox: Arc<Mutex<OutboxStore>>,
        policy: Arc<Mutex<PolicyEngine>>,
        lane: Arc<SerializedMutationExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            journal,
            outbox,
            policy,
            lane,
            clock,
        })
    }

    /// Lifecycle history + mutating events for one command.
    pub fn audit_get(&self, command_id: &str) -> mu_journal::Result<Vec<JournalEntry>> {
        self.journal.lock().unwrap().history(command_id)
    }

    pub fn dlq_list(&self) -> Vec<OutboxRecord> {
        self.outbox.lock().unwrap().dead_letters()
    }

    pub fn dlq_inspect(&self, outbox_id: &str) -> Option<OutboxRecord> {
        self.outbox.lock().unwrap().get(outbox_id).cloned()
    }

    /// Replay through the serialized lane — this is the HTTP-side path; the
    /// command handler below runs inside the lane already.
    pub async fn dlq_replay(&self, outbox_id: &str) -> mu_outbox::Result<OutboxRecord> {
        let now = self.clock.now_ms();
        self.lane
            .run(|| async { self.outbox.lock().unwrap().replay(outbox_id, now) })
            .await
    }

    pub fn kill_switch_set(&self, target: KillSwitchTarget, disabled: bool) {
        self.policy.lock().unwrap().set_kill_switch(target, disabled);
    }

    pub fn rate_limit_override(&self, rate_limit: RateLimitPolicy) {
        self.policy.lock().unwrap().override_rate_limit(rate_limit);
    }

    pub fn policy_update(&self, next: PolicySet) {
        self.policy.lock().unwrap().set_policy(next);
    }
}

// ── command handlers ─────────────────────────────────────────────────────────

pub struct AuditGetHandler {
    journal: Arc<Mutex<CommandJournal>>,
}

impl AuditGetHandler {
    pub fn new(journal: Arc<Mutex<CommandJournal>>) -> Arc<Self> {
        Arc::new(Self { journal })
    }
}

#[async_trait]
impl CommandHandler for AuditGetHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let Some(command_id) = record.target_id.as_deref() else {
            return HandlerOutcome::failed("cli_validation_failed");
        };
        match self.journal.lock().unwrap().history(command_id) {
            Ok(entries) if entries.is_empty() => HandlerOutcome::failed("context_missing"),
            Ok(entries) => HandlerOutcome::completed(serde_json::json!({
                "command_id": command_id,
                "entries": entries,
            })),
            Err(e) => HandlerOutcome::failed(e.code()),
        }
    }
}

pub struct DlqListHandler {
    outbox: Arc<Mutex<OutboxStore>>,
}

impl DlqListHandler {
    pub fn new(outbox: Arc<Mutex<OutboxStore>>) -> Arc<Self> {
        Arc::new(Self { outbox })
    }
}

#[async_trait]
impl CommandHandler for DlqListHandler {
    async fn handle(&self, _record: &CommandRecord) -> HandlerOutcome {
        let dead = self.outbox.lock().unwrap().dead_letters();
        HandlerOutcome::completed(serde_json::json!({
            "count": dead.len(),
            "records": dead,
        }))
    }
}

pub struct DlqInspectHandler {
    outbox: Arc<Mutex<OutboxStore>>,
}

impl DlqInspectHandler {
    pub fn new(outbox: Arc<Mutex<OutboxStore>>) -> Arc<Self> {
        Arc::new(Self { outbox })
    }
}

#[async_trait]
impl CommandHandler for DlqInspectHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let Some(outbox_id) = record.target_id.as_deref() else {
            return HandlerOutcome::failed("cli_validation_failed");
        };
        match self.outbox.lock().unwrap().get(outbox_id) {
            Some(found) => HandlerOutcome::completed(serde_json::to_value(found).unwrap_or_default()),
            None => HandlerOutcome::failed("context_missing"),
        }
    }
}

/// Runs inside the serialized lane already, so it touches the store
/// directly — re-entering the lane here would deadlock.
pub struct DlqReplayHandler {
    outbox: Arc<Mutex<OutboxStore>>,
    clock: Arc<dyn Clock>,
}

impl DlqReplayHandler {
    pub fn new(outbox: Arc<Mutex<OutboxStore>>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self { outbox, clock })
    }
}

#[async_trait]
impl CommandHandler for DlqReplayHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let Some(outbox_id) = record.target_id.as_deref() else {
            return HandlerOutcome::failed("cli_validation_failed");
        };
        match self
            .outbox
            .lock()
            .unwrap()
            .replay(outbox_id, self.clock.now_ms())
        {
            Ok(replayed) => HandlerOutcome::completed_with_events(
                serde_json::json!({
                    "outbox_id": replayed.outbox_id,
                    "replay_of_outbox_id": replayed.replay_of_outbox_id,
                }),
                vec![ReplayMutationEvent::new(
                    "outbox.replayed",
                    serde_json::json!({"outbox_id": replayed.outbox_id}),
                )],
            ),
            Err(e) => HandlerOutcome::failed(e.code()),
        }
    }
}

/// `kill-switch set global on` / `kill-switch set channel slack off` /
/// `kill-switch set class issue on`. "on" means the switch is engaged
/// (mutations disabled).
pub struct KillSwitchHandler {
    policy: Arc<Mutex<PolicyEngine>>,
}

impl KillSwitchHandler {
    pub fn new(policy: Arc<Mutex<PolicyEngine>>) -> Arc<Self> {
        Arc::new(Self { policy })
    }
}

#[async_trait]
impl CommandHandler for KillSwitchHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let args = &record.command_args;
        let parsed = match args.first().map(|s| s.as_str()) {
            Some("global") => args
                .get(1)
                .and_then(|s| parse_on_off(s))
                .map(|on| (KillSwitchTarget::Global, on)),
            Some("channel") => match (args.get(1), args.get(2).and_then(|s| parse_on_off(s))) {
                (Some(channel), Some(on)) => Some((
                    KillSwitchTarget::Channel {
                        channel: channel.clone(),
                    },
                    on,
                )),
                _ => None,
            },
            Some("class") => match (args.get(1), args.get(2).and_then(|s| parse_on_off(s))) {
                (Some(class), Some(on)) => Some((
                    KillSwitchTarget::Class {
                        ops_class: class.clone(),
                    },
                    on,
                )),
                _ => None,
            },
            _ => None,
        };

        let Some((target, disabled)) = parsed else {
            return HandlerOutcome::failed("cli_validation_failed");
        };
        info!(?target, disabled, "kill switch set");
        self.policy
            .lock()
            .unwrap()
            .set_kill_switch(target.clone(), disabled);
        HandlerOutcome::completed_with_events(
            serde_json::json!({"target": target, "disabled": disabled}),
            vec![ReplayMutationEvent::new(
                "policy.kill_switch_set",
                serde_json::json!({"target": target, "disabled": disabled}),
            )],
        )
    }
}

fn parse_on_off(token: &str) -> Option<bool> {
    match token {
        "on" | "true" => Some(true),
        "off" | "false" => Some(false),
        _ => None,
    }
}

/// `rate-limit override actor_limit=5 window_ms=30000 overflow=fail`.
pub struct RateLimitOverrideHandler {
    policy: Arc<Mutex<PolicyEngine>>,
}

impl RateLimitOverrideHandler {
    pub fn new(policy: Arc<Mutex<PolicyEngine>>) -> Arc<Self> {
        Arc::new(Self { policy })
    }
}

#[async_trait]
impl CommandHandler for RateLimitOverrideHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let mut limits = {
            let policy = self.policy.lock().unwrap();
            policy.policy().rate_limit.clone()
        };
        for arg in &record.command_args {
            let Some((key, value)) = arg.split_once('=') else {
                return HandlerOutcome::failed("cli_validation_failed");
            };
            let ok = match key {
                "window_ms" => value.parse().map(|v| limits.window_ms = v).is_ok(),
                "actor_limit" => value.parse().map(|v| limits.actor_limit = v).is_ok(),
                "channel_limit" => value.parse().map(|v| limits.channel_limit = v).is_ok(),
                "defer_ms" => value.parse().map(|v| limits.defer_ms = v).is_ok(),
                "overflow" => match value {
                    "defer" => {
                        limits.overflow_behavior = OverflowBehavior::Defer;
                        true
                    }
                    "fail" => {
                        limits.overflow_behavior = OverflowBehavior::Fail;
                        true
                    }
                    _ => false,
                },
                _ => false,
            };
            if !ok {
                return HandlerOutcome::failed("cli_validation_failed");
            }
        }
        info!(?limits, "rate limit overridden");
        self.policy.lock().unwrap().override_rate_limit(limits.clone());
        HandlerOutcome::completed_with_events(
            serde_json::to_value(&limits)
                .map(|limits| serde_json::json!({"rate_limit": limits}))
                .unwrap_or_default(),
            vec![ReplayMutationEvent::new(
                "policy.rate_limit_overridden",
                serde_json::to_value(&limits).unwrap_or_default(),
            )],
        )
    }
}

/// `policy update {…}` — args joined back together must parse as a full
/// [`PolicySet`]. Replacing wholesale keeps the reset atomic.
pub struct PolicyUpdateHandler {
    policy: Arc<Mutex<PolicyEngine>>,
}

impl PolicyUpdateHandler {
    pub fn new(policy: Arc<Mutex<PolicyEngine>>) -> Arc<Self> {
        Arc::new(Self { policy })
    }
}

#[async_trait]
impl CommandHandler for PolicyUpdateHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        let raw = record.command_args.join(" ");
        let next: PolicySet = match serde_json::from_str(&raw) {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "policy update payload rejected");
                return HandlerOutcome::failed("cli_validation_failed");
            }
        };
        let rules = next.rules.len();
        self.policy.lock().unwrap().set_policy(next);
        HandlerOutcome::completed_with_events(
            serde_json::json!({"rules": rules}),
            vec![ReplayMutationEvent::new(
                "policy.updated",
                serde_json::json!({"rules": rules}),
            )],
        )
    }
}

/// `status` — runtime snapshot.
pub struct RuntimeStatusHandler {
    generations: Arc<GenerationSupervisor>,
    telemetry: Arc<Telemetry>,
    counters: Arc<PipelineCounters>,
    runs: Arc<RunSupervisor>,
    outbox: Arc<Mutex<OutboxStore>>,
}

impl RuntimeStatusHandler {
    pub fn new(
        generations: Arc<GenerationSupervisor>,
        telemetry: Arc<Telemetry>,
        counters: Arc<PipelineCounters>,
        runs: Arc<RunSupervisor>,
        outbox: Arc<Mutex<OutboxStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            generations,
            telemetry,
            counters,
            runs,
            outbox,
        })
    }
}

#[async_trait]
impl CommandHandler for RuntimeStatusHandler {
    async fn handle(&self, _record: &CommandRecord) -> HandlerOutcome {
        let running = self
            .runs
            .list()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .count();
        HandlerOutcome::completed(serde_json::json!({
            "generation": self.generations.generation(),
            "routes": self.generations.current().routes(),
            "pipeline": self.counters.snapshot(),
            "observability": self.telemetry.snapshot(),
            "gate": self.telemetry.evaluate_gate(&GateThresholds::default()),
            "runs_running": running,
            "outbox_pending": self.outbox.lock().unwrap().pending_count(),
        }))
    }
}

/// `ready` — writer lock + store health.
pub struct ReadyHandler {
    lock: Arc<Mutex<Option<WriterLock>>>,
}

impl ReadyHandler {
    pub fn new(lock: Arc<Mutex<Option<WriterLock>>>) -> Arc<Self> {
        Arc::new(Self { lock })
    }
}

#[async_trait]
impl CommandHandler for ReadyHandler {
    async fn handle(&self, _record: &CommandRecord) -> HandlerOutcome {
        let held = self
            .lock
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.assert_held().is_ok())
            .unwrap_or(false);
        if held {
            HandlerOutcome::completed(serde_json::json!({"ready": true}))
        } else {
            HandlerOutcome::failed("writer_lock_busy")
        }
    }
}

/// `run start <prompt…>` / `run resume <root>` — launches through the run
/// supervisor and correlates the job back to the command.
pub struct RunTriggerHandler {
    runs: Arc<RunSupervisor>,
    run_triggers_enabled: bool,
    default_max_steps: u32,
}

impl RunTriggerHandler {
    pub fn new(runs: Arc<RunSupervisor>, run_triggers_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            runs,
            run_triggers_enabled,
            default_max_steps: 32,
        })
    }
}

/// Split `--max-steps N` out of the argument list, leaving the rest.
fn extract_max_steps(args: &[String]) -> (Option<u32>, Vec<String>) {
    let mut max_steps = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--max-steps" {
            max_steps = iter.next().and_then(|v| v.parse().ok());
        } else {
            rest.push(arg.clone());
        }
    }
    (max_steps, rest)
}

#[async_trait]
impl CommandHandler for RunTriggerHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        if !self.run_triggers_enabled {
            return HandlerOutcome::failed("operator_action_disallowed");
        }

        let (max_steps, args) = extract_max_steps(&record.command_args);
        let opts = LaunchOptions {
            max_steps: max_steps.unwrap_or(self.default_max_steps),
            command_id: Some(record.command_id.0.clone()),
            correlation: record.correlation.clone(),
            route: Some(RunRoute {
                channel: record.channel,
                channel_tenant_id: record.channel_tenant_id.clone(),
                channel_conversation_id: record.channel_conversation_id.clone(),
            }),
            source_is_api: false,
        };

        let launched = match record.target_type.as_str() {
            "run start" => {
                let prompt = args.join(" ");
                if prompt.is_empty() {
                    return HandlerOutcome::failed("cli_validation_failed");
                }
                self.runs.launch_start(&prompt, opts)
            }
            "run resume" => match record.target_id.as_deref() {
                Some(root) => self.runs.launch_resume(root, opts),
                None => return HandlerOutcome::failed("cli_validation_failed"),
            },
            _ => return HandlerOutcome::failed("cli_validation_failed"),
        };

        match launched {
            Ok(snapshot) => HandlerOutcome::completed_with_events(
                serde_json::json!({
                    "job_id": snapshot.job_id,
                    "pid": snapshot.pid,
                    "run_root_id": snapshot.root_issue_id,
                }),
                vec![ReplayMutationEvent::new(
                    "run.launched",
                    serde_json::json!({
                        "job_id": snapshot.job_id,
                        "mode": snapshot.mode,
                    }),
                )],
            ),
            Err(e) => HandlerOutcome::failed(e.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_steps_flag_is_extracted_from_args() {
        let args: Vec<String> = ["fix", "the", "bug", "--max-steps", "12"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (max_steps, rest) = extract_max_steps(&args);
        assert_eq!(max_steps, Some(12));
        assert_eq!(rest.join(" "), "fix the bug");
    }

    #[test]
    fn missing_flag_leaves_args_untouched() {
        let args: Vec<String> = vec!["mu-root-1".to_string()];
        let (max_steps, rest) = extract_max_steps(&args);
        assert_eq!(max_steps, None);
        assert_eq!(rest, args);
    }

    #[test]
    fn kill_switch_tokens_parse() {
        assert_eq!(parse_on_off("on"), Some(true));
        assert_eq!(parse_on_off("off"), Some(false));
        assert_eq!(parse_on_off("maybe"), None);
    }
}
