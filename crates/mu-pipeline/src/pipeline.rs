use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use mu_core::config::{OutboxConfig, PipelineConfig};
use mu_core::surface::parse_command_text;
use mu_core::types::CommandId;
use mu_core::{Clock, CommandRecord, CommandState, InboundEnvelope, TransitionOptions};
use mu_identity::{IdentityBinding, IdentityStore};
use mu_journal::{ClaimOutcome, CommandJournal, IdempotencyLedger, SerializedMutationExecutor};
use mu_outbox::present;
use mu_outbox::{EnvelopeKind, OutboundEnvelope, OutboxStore};
use mu_policy::{AuthorizationDecision, PolicyEngine, SafetyDecision};

use crate::handlers::{HandlerOutcome, HandlerRegistry};
use crate::result::{PipelineCounters, PipelineResult};

/// Confirm/cancel fast-path parse.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConfirmAction {
    Confirm(String),
    Cancel(String),
}

fn parse_confirm_cancel(text: &str) -> Option<ConfirmAction> {
    let mut tokens = text.split_whitespace();
    let first = tokens.next()?;
    let first = match first {
        "/mu" | "mu" | "mu!" | "mu?" => tokens.next()?,
        other => other,
    };
    let id = tokens.next()?;
    if tokens.next().is_some() || !id.starts_with("cmd-") {
        return None;
    }
    match first {
        "confirm" => Some(ConfirmAction::Confirm(id.to_string())),
        "cancel" => Some(ConfirmAction::Cancel(id.to_string())),
        _ => None,
    }
}

/// The command pipeline. Verification and normalization happen in the
/// adapters; from here on everything that mutates durable state runs inside
/// the serialized lane.
pub struct CommandPipeline {
    lane: Arc<SerializedMutationExecutor>,
    journal: Arc<Mutex<CommandJournal>>,
    ledger: Arc<Mutex<IdempotencyLedger>>,
    identities: Arc<Mutex<IdentityStore>>,
    policy: Arc<Mutex<PolicyEngine>>,
    outbox: Arc<Mutex<OutboxStore>>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    pipeline_config: PipelineConfig,
    outbox_config: OutboxConfig,
    counters: Arc<PipelineCounters>,
}

impl CommandPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lane: Arc<SerializedMutationExecutor>,
        journal: Arc<Mutex<CommandJournal>>,
        ledger: Arc<Mutex<IdempotencyLedger>>,
        identities: Arc<Mutex<IdentityStore>>,
        policy: Arc<Mutex<PolicyEngine>>,
        outbox: Arc<Mutex<OutboxStore>>,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
        pipeline_config: PipelineConfig,
        outbox_config: OutboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            lane,
            journal,
            ledger,
            identities,
            policy,
            outbox,
            handlers,
            clock,
            pipeline_config,
            outbox_config,
            counters: Arc::new(PipelineCounters::default()),
        })
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    pub fn journal(&self) -> Arc<Mutex<CommandJournal>> {
        self.journal.clone()
    }

    pub fn outbox(&self) -> Arc<Mutex<OutboxStore>> {
        self.outbox.clone()
    }

    pub fn policy(&self) -> Arc<Mutex<PolicyEngine>> {
        self.policy.clone()
    }

    pub fn identities(&self) -> Arc<Mutex<IdentityStore>> {
        self.identities.clone()
    }

    pub fn lane(&self) -> Arc<SerializedMutationExecutor> {
        self.lane.clone()
    }

    /// Entry point for every verified envelope (adapter or synthetic wake).
    pub async fn handle_inbound(&self, envelope: InboundEnvelope) -> PipelineResult {
        if let Err(detail) = envelope.validate() {
            return self.deny("adapter_payload_invalid", &detail);
        }

        // Confirmation fast path: `confirm <command_id>` / `cancel <command_id>`.
        if let Some(action) = parse_confirm_cancel(&envelope.command_text) {
            return self
                .lane
                .run(|| self.handle_confirmation(action, &envelope))
                .await;
        }

        let Some(parsed) = parse_command_text(&envelope.command_text) else {
            return self.deny(
                "unmapped_command",
                &format!("unrecognized command: {}", envelope.command_text),
            );
        };

        // Identity binding. Link bootstrap commands run with a provisional
        // tier_c binding so an unlinked actor can reach them.
        let resolved = self
            .identities
            .lock()
            .unwrap()
            .resolve(&envelope.actor_binding_id)
            .map(|b| b.clone());
        let binding = match resolved {
            Ok(binding) => binding,
            Err(_) if matches!(parsed.target_type.as_str(), "link begin" | "link finish") => {
                provisional_binding(&envelope, self.clock.now_ms())
            }
            Err(e) => return self.deny(e.code(), &e.to_string()),
        };

        let decision = self.policy.lock().unwrap().authorize_command(
            &parsed.target_type,
            &binding,
            parsed.mode,
        );
        let (rule, effective_scope) = match decision {
            AuthorizationDecision::Allow {
                rule,
                effective_scope,
            } => (rule, effective_scope),
            AuthorizationDecision::Deny { reason, detail } => return self.deny(reason, &detail),
        };

        // Serialized section: safety gate, idempotency, journal, route.
        self.lane
            .run(|| async {
                let now = self.clock.now_ms();

                let mut safety_defer: Option<i64> = None;
                if rule.mutating {
                    let verdict = self.policy.lock().unwrap().evaluate_mutation_safety(
                        envelope.channel,
                        &binding.binding_id,
                        &rule.ops_class,
                        now,
                    );
                    match verdict {
                        SafetyDecision::Allow => {}
                        SafetyDecision::Defer { retry_at_ms } => safety_defer = Some(retry_at_ms),
                        SafetyDecision::Deny { reason, detail } => {
                            return self.deny(reason, &detail)
                        }
                    }
                }

                let command_id = CommandId::new();
                let claim = self.ledger.lock().unwrap().claim(
                    &envelope.idempotency_key,
                    &envelope.fingerprint,
                    command_id.as_str(),
                    self.pipeline_config.idempotency_ttl_ms,
                    now,
                );
                match claim {
                    Ok(ClaimOutcome::Created) => {}
                    Ok(ClaimOutcome::Duplicate { command_id: winner }) => {
                        self.counters.duplicate_total.fetch_add(1, Ordering::Relaxed);
                        debug!(command_id = %winner, "duplicate request; replaying presentation");
                        let journal = self.journal.lock().unwrap();
                        return match journal.get(&winner) {
                            Some(record) => PipelineResult::from_record(record),
                            None => PipelineResult::Accepted { command_id: winner },
                        };
                    }
                    Ok(ClaimOutcome::Conflict { command_id: winner }) => {
                        return self.deny(
                            "idempotency_conflict",
                            &format!("key already bound to {winner} with different content"),
                        )
                    }
                    Err(e) => return self.deny(e.code(), &e.to_string()),
                }

                let mut record =
                    CommandRecord::with_id(command_id, &envelope, parsed.args.clone(), now);
                record.target_type = parsed.target_type.clone();
                if parsed.target_id.is_some() {
                    record.target_id = parsed.target_id.clone();
                }
                record.assurance_tier = binding.assurance_tier;
                record.scope_required = rule.scopes[0].clone();
                record.scope_effective = effective_scope.clone();

                if let Err(e) = self.journal_lifecycle(&record) {
                    error!(error = %e, "failed to journal accepted command");
                    return self.deny(e.code(), &e.to_string());
                }
                self.counters.accepted_total.fetch_add(1, Ordering::Relaxed);
                info!(
                    command_id = %record.command_id,
                    target_type = %record.target_type,
                    channel = %record.channel,
                    "command accepted"
                );

                if let Some(retry_at_ms) = safety_defer {
                    return self.defer_for_backpressure(record, retry_at_ms);
                }

                if rule.mutating && rule.confirmation_required {
                    let expires_at_ms = now + self.pipeline_config.confirmation_ttl_ms;
                    if let Err(e) = self.transition_and_journal(
                        &mut record,
                        CommandState::AwaitingConfirmation,
                        TransitionOptions {
                            confirmation_expires_at_ms: Some(expires_at_ms),
                            ..Default::default()
                        },
                    ) {
                        return e;
                    }
                    let prompt = present::present_confirmation_request(
                        &record.target_type,
                        record.command_id.as_str(),
                        expires_at_ms,
                    );
                    self.enqueue_body(&record, EnvelopeKind::Lifecycle, prompt.detailed);
                    return PipelineResult::AwaitingConfirmation {
                        command_id: record.command_id.0.clone(),
                        expires_at_ms,
                    };
                }

                self.execute(record).await
            })
            .await
    }

    /// Requeue deferred commands whose retry time has arrived. Returns how
    /// many became eligible this pass.
    pub async fn poll_deferred(&self) -> usize {
        self.lane
            .run(|| async {
                let now = self.clock.now_ms();
                let due: Vec<CommandRecord> = self
                    .journal
                    .lock()
                    .unwrap()
                    .in_state(CommandState::Deferred)
                    .into_iter()
                    .filter(|r| r.retry_at_ms.unwrap_or(i64::MAX) <= now)
                    .collect();
                let count = due.len();

                for mut record in due {
                    let rule = self
                        .policy
                        .lock()
                        .unwrap()
                        .rule(&record.target_type)
                        .cloned();
                    let mutating = rule.as_ref().map(|r| r.mutating).unwrap_or(false);
                    if mutating {
                        let ops_class = rule
                            .as_ref()
                            .map(|r| r.ops_class.clone())
                            .unwrap_or_default();
                        let verdict = self.policy.lock().unwrap().evaluate_mutation_safety(
                            record.channel,
                            &record.actor_binding_id,
                            &ops_class,
                            now,
                        );
                        match verdict {
                            SafetyDecision::Allow => {}
                            SafetyDecision::Defer { retry_at_ms } => {
                                // Window still full — push the retry time out.
                                if self
                                    .transition_and_journal(
                                        &mut record,
                                        CommandState::Queued,
                                        TransitionOptions::default(),
                                    )
                                    .is_err()
                                {
                                    continue;
                                }
                                let _ = self.transition_and_journal(
                                    &mut record,
                                    CommandState::Deferred,
                                    TransitionOptions {
                                        retry_at_ms: Some(retry_at_ms),
                                        ..Default::default()
                                    },
                                );
                                continue;
                            }
                            SafetyDecision::Deny { reason, .. } => {
                                if self
                                    .transition_and_journal(
                                        &mut record,
                                        CommandState::Cancelled,
                                        TransitionOptions {
                                            error_code: Some(reason.to_string()),
                                            ..Default::default()
                                        },
                                    )
                                    .is_ok()
                                {
                                    self.counters.cancelled_total.fetch_add(1, Ordering::Relaxed);
                                    self.enqueue_presentation(&record, Some(reason));
                                }
                                continue;
                            }
                        }
                    }
                    self.execute(record).await;
                }
                count
            })
            .await
    }

    // ── confirmation lifecycle ───────────────────────────────────────────────

    async fn handle_confirmation(
        &self,
        action: ConfirmAction,
        envelope: &InboundEnvelope,
    ) -> PipelineResult {
        let now = self.clock.now_ms();
        let (command_id, is_confirm) = match &action {
            ConfirmAction::Confirm(id) => (id.clone(), true),
            ConfirmAction::Cancel(id) => (id.clone(), false),
        };

        let record = self.journal.lock().unwrap().get(&command_id).cloned();
        let Some(mut record) = record else {
            return self.deny("context_missing", &format!("unknown command {command_id}"));
        };

        // Only the binding that submitted the command may settle it.
        if envelope.actor_binding_id != record.actor_binding_id {
            return self.deny(
                "confirmation_invalid_actor",
                "confirm/cancel must come from the original binding",
            );
        }

        if is_confirm {
            if record.state.is_terminal() || record.state != CommandState::AwaitingConfirmation {
                // Idempotent: replay whatever the command settled to.
                return PipelineResult::from_record(&record);
            }
            let expires = record.confirmation_expires_at_ms.unwrap_or(i64::MAX);
            if now >= expires {
                if let Err(e) = self.transition_and_journal(
                    &mut record,
                    CommandState::Expired,
                    TransitionOptions {
                        error_code: Some("confirmation_expired".to_string()),
                        ..Default::default()
                    },
                ) {
                    return e;
                }
                self.counters.expired_total.fetch_add(1, Ordering::Relaxed);
                self.enqueue_presentation(&record, Some("confirmation_expired"));
                return PipelineResult::Expired {
                    command_id: record.command_id.0.clone(),
                };
            }
            info!(command_id = %record.command_id, "confirmation received; executing");
            return self.execute(record).await;
        }

        // Cancel path.
        if matches!(
            record.state,
            CommandState::Accepted
                | CommandState::AwaitingConfirmation
                | CommandState::Queued
                | CommandState::Deferred
        ) {
            if let Err(e) = self.transition_and_journal(
                &mut record,
                CommandState::Cancelled,
                TransitionOptions::default(),
            ) {
                return e;
            }
            self.counters.cancelled_total.fetch_add(1, Ordering::Relaxed);
            self.enqueue_presentation(&record, None);
            return PipelineResult::Cancelled {
                command_id: record.command_id.0.clone(),
            };
        }
        PipelineResult::from_record(&record)
    }

    // ── execution ────────────────────────────────────────────────────────────

    /// Drive a routed command through queued → in_progress → handler →
    /// terminal (or deferred). Runs inside the serialized lane.
    async fn execute(&self, mut record: CommandRecord) -> PipelineResult {
        if matches!(
            record.state,
            CommandState::Accepted | CommandState::AwaitingConfirmation | CommandState::Deferred
        ) {
            if let Err(e) = self.transition_and_journal(
                &mut record,
                CommandState::Queued,
                TransitionOptions::default(),
            ) {
                return e;
            }
        }
        if let Err(e) = self.transition_and_journal(
            &mut record,
            CommandState::InProgress,
            TransitionOptions::default(),
        ) {
            return e;
        }

        let outcome = match self.handlers.get(&record.target_type) {
            Some(handler) => handler.handle(&record).await,
            None => {
                warn!(target_type = %record.target_type, "no handler registered");
                HandlerOutcome::failed("replay_handler_error")
            }
        };

        // Mutating events land before the final lifecycle transition.
        let now = self.clock.now_ms();
        for event in outcome.events() {
            if let Err(e) = self.journal.lock().unwrap().append_mutating(
                record.command_id.as_str(),
                &event.event_type,
                record.state,
                &record.correlation,
                event.payload.clone(),
                now,
            ) {
                error!(error = %e, "failed to journal mutating event");
            }
        }

        match outcome {
            HandlerOutcome::Completed {
                result, error_code, ..
            } => {
                enrich_correlation(&mut record, &result);
                if let Err(e) = self.transition_and_journal(
                    &mut record,
                    CommandState::Completed,
                    TransitionOptions {
                        error_code,
                        result: Some(result.clone()),
                        ..Default::default()
                    },
                ) {
                    return e;
                }
                self.counters.completed_total.fetch_add(1, Ordering::Relaxed);
                self.enqueue_presentation(&record, None);
                PipelineResult::Completed {
                    command_id: record.command_id.0.clone(),
                    result,
                }
            }
            HandlerOutcome::Failed { error_code, .. } => {
                if let Err(e) = self.transition_and_journal(
                    &mut record,
                    CommandState::Failed,
                    TransitionOptions {
                        error_code: Some(error_code.clone()),
                        ..Default::default()
                    },
                ) {
                    return e;
                }
                self.counters.failed_total.fetch_add(1, Ordering::Relaxed);
                self.enqueue_presentation(&record, Some(&error_code));
                PipelineResult::Failed {
                    command_id: record.command_id.0.clone(),
                    error_code,
                }
            }
            HandlerOutcome::Cancelled { error_code, .. } => {
                if let Err(e) = self.transition_and_journal(
                    &mut record,
                    CommandState::Cancelled,
                    TransitionOptions {
                        error_code,
                        ..Default::default()
                    },
                ) {
                    return e;
                }
                self.counters.cancelled_total.fetch_add(1, Ordering::Relaxed);
                self.enqueue_presentation(&record, None);
                PipelineResult::Cancelled {
                    command_id: record.command_id.0.clone(),
                }
            }
            HandlerOutcome::Deferred {
                retry_at_ms,
                error_code,
                ..
            } => {
                if let Err(e) = self.transition_and_journal(
                    &mut record,
                    CommandState::Deferred,
                    TransitionOptions {
                        retry_at_ms: Some(retry_at_ms),
                        error_code,
                        ..Default::default()
                    },
                ) {
                    return e;
                }
                self.counters.deferred_total.fetch_add(1, Ordering::Relaxed);
                self.enqueue_presentation(&record, Some("backpressure_deferred"));
                PipelineResult::Deferred {
                    command_id: record.command_id.0.clone(),
                    retry_at_ms,
                }
            }
        }
    }

    fn defer_for_backpressure(
        &self,
        mut record: CommandRecord,
        retry_at_ms: i64,
    ) -> PipelineResult {
        if let Err(e) = self.transition_and_journal(
            &mut record,
            CommandState::Queued,
            TransitionOptions::default(),
        ) {
            return e;
        }
        if let Err(e) = self.transition_and_journal(
            &mut record,
            CommandState::Deferred,
            TransitionOptions {
                retry_at_ms: Some(retry_at_ms),
                error_code: Some("backpressure_deferred".to_string()),
                ..Default::default()
            },
        ) {
            return e;
        }
        self.counters.deferred_total.fetch_add(1, Ordering::Relaxed);
        self.enqueue_presentation(&record, Some("backpressure_deferred"));
        PipelineResult::Deferred {
            command_id: record.command_id.0.clone(),
            retry_at_ms,
        }
    }

    // ── helpers ──────────────────────────────────────────────────────────────

    fn transition_and_journal(
        &self,
        record: &mut CommandRecord,
        next: CommandState,
        opts: TransitionOptions,
    ) -> Result<(), PipelineResult> {
        let now = self.clock.now_ms();
        if let Err(e) = record.transition(next, now, opts) {
            error!(command_id = %record.command_id, error = %e, "illegal transition");
            return Err(self.deny(e.code(), &e.to_string()));
        }
        if let Err(e) = self.journal_lifecycle(record) {
            error!(command_id = %record.command_id, error = %e, "journal append failed");
            return Err(self.deny(e.code(), &e.to_string()));
        }
        Ok(())
    }

    fn journal_lifecycle(&self, record: &CommandRecord) -> mu_journal::Result<()> {
        self.journal
            .lock()
            .unwrap()
            .append_lifecycle(record, self.clock.now_ms())
    }

    /// Queue the detailed presentation of a settled (or waiting) command.
    fn enqueue_presentation(&self, record: &CommandRecord, reason: Option<&str>) {
        let detail = record
            .result
            .as_ref()
            .map(|r| serde_json::to_string_pretty(r).unwrap_or_default());
        let message = present::present(
            &record.target_type,
            record.state.as_str(),
            reason,
            detail.as_deref(),
        );
        let kind = present::kind_for_state(record.state);
        self.enqueue_body(record, kind, message.detailed);
    }

    fn enqueue_body(&self, record: &CommandRecord, kind: EnvelopeKind, body: String) {
        let envelope = OutboundEnvelope {
            channel: record.channel,
            channel_tenant_id: record.channel_tenant_id.clone(),
            channel_conversation_id: record.channel_conversation_id.clone(),
            kind,
            body,
            correlation: record.correlation.clone(),
            metadata: serde_json::json!({}),
        };
        let dedupe_key = format!(
            "cmd:{}:{}:{}",
            record.command_id, record.state.as_str(), record.attempt
        );
        let max_attempts = match kind {
            EnvelopeKind::Ack => self.outbox_config.max_attempts_ack,
            EnvelopeKind::Lifecycle => self.outbox_config.max_attempts_lifecycle,
            EnvelopeKind::Result => self.outbox_config.max_attempts_result,
            EnvelopeKind::Error => self.outbox_config.max_attempts_error,
        };
        if let Err(e) = self.outbox.lock().unwrap().enqueue(
            envelope,
            &dedupe_key,
            max_attempts,
            self.clock.now_ms(),
        ) {
            error!(error = %e, "failed to enqueue outbox presentation");
        }
    }

    fn deny(&self, reason: &str, detail: &str) -> PipelineResult {
        self.counters.denied_total.fetch_add(1, Ordering::Relaxed);
        warn!(reason, detail, "request denied");
        PipelineResult::Denied {
            reason: reason.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Tier-C stand-in binding for link bootstrap commands from unlinked actors.
fn provisional_binding(envelope: &InboundEnvelope, now_ms: i64) -> IdentityBinding {
    IdentityBinding {
        binding_id: envelope.actor_binding_id.clone(),
        channel: envelope.channel,
        channel_tenant_id: envelope.channel_tenant_id.clone(),
        actor_id: envelope.actor_id.clone(),
        display_name: envelope.actor_id.clone(),
        scopes: vec!["cp.read".to_string()],
        assurance_tier: mu_core::AssuranceTier::TierC,
        linked_at_ms: now_ms,
        revoked: false,
    }
}

/// Copy correlation facts a handler surfaced in its result JSON onto the
/// record before the terminal journal entry.
fn enrich_correlation(record: &mut CommandRecord, result: &serde_json::Value) {
    if let Some(run_root_id) = result.get("run_root_id").and_then(|v| v.as_str()) {
        record.correlation.run_root_id = Some(run_root_id.to_string());
    }
    if let Some(id) = result.get("cli_invocation_id").and_then(|v| v.as_str()) {
        record.correlation.cli_invocation_id = Some(id.to_string());
    }
    if let Some(kind) = result.get("cli_command_kind").and_then(|v| v.as_str()) {
        record.correlation.cli_command_kind = Some(kind.to_string());
    }
}
