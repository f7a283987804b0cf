//! End-to-end pipeline scenarios: confirmation lifecycle, idempotency,
//! backpressure, and dead-letter replay, all on a manual clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mu_core::config::{OutboxConfig, PipelineConfig, SafetyConfig};
use mu_core::envelope::{fingerprint, InboundEnvelope, ENVELOPE_VERSION};
use mu_core::{AssuranceTier, Channel, Clock, CommandRecord, CommandState, ManualClock};
use mu_identity::{IdentityBinding, IdentityStore, LinkCodeRegistry};
use mu_journal::{CommandJournal, IdempotencyLedger, JournalEntry, SerializedMutationExecutor};
use mu_outbox::{
    Deliverer, DeliveryOutcome, EnvelopeKind, OutboundEnvelope, OutboxDispatcher, OutboxState,
    OutboxStore,
};
use mu_pipeline::identity_handlers::{LinkBeginHandler, LinkFinishHandler};
use mu_pipeline::{
    CommandHandler, CommandPipeline, HandlerOutcome, HandlerRegistry, PipelineResult,
};
use mu_policy::{PolicyEngine, PolicySet};

struct CountingHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler for CountingHandler {
    async fn handle(&self, record: &CommandRecord) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::completed(serde_json::json!({
            "target": record.target_id,
            "ok": true,
        }))
    }
}

struct Harness {
    pipeline: Arc<CommandPipeline>,
    clock: Arc<ManualClock>,
    journal: Arc<Mutex<CommandJournal>>,
    outbox: Arc<Mutex<OutboxStore>>,
    lane: Arc<SerializedMutationExecutor>,
    handler_calls: Arc<AtomicU32>,
    outbox_config: OutboxConfig,
    _dir: tempfile::TempDir,
}

fn harness(pipeline_config: PipelineConfig, safety: SafetyConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::at(0);
    let lane = SerializedMutationExecutor::new();

    let journal = Arc::new(Mutex::new(CommandJournal::open(dir.path()).unwrap()));
    let ledger = Arc::new(Mutex::new(IdempotencyLedger::open(dir.path()).unwrap()));
    let outbox = Arc::new(Mutex::new(OutboxStore::open(dir.path()).unwrap()));

    let mut identities = IdentityStore::open(dir.path()).unwrap();
    for (binding_id, actor) in [("bind-a", "U-alice"), ("bind-b", "U-bob")] {
        identities
            .upsert(IdentityBinding {
                binding_id: binding_id.to_string(),
                channel: Channel::Slack,
                channel_tenant_id: "T1".into(),
                actor_id: actor.to_string(),
                display_name: actor.to_string(),
                scopes: vec![
                    "cp.read".into(),
                    "cp.issue.write".into(),
                    "cp.forum.write".into(),
                    "cp.run.write".into(),
                ],
                assurance_tier: AssuranceTier::TierA,
                linked_at_ms: 0,
                revoked: false,
            })
            .unwrap();
    }
    let identities = Arc::new(Mutex::new(identities));

    let policy = Arc::new(Mutex::new(PolicyEngine::new(PolicySet::from_config(&safety))));

    let handler_calls = Arc::new(AtomicU32::new(0));
    let handlers = HandlerRegistry::new();
    for key in ["status", "issue close", "forum post", "run resume"] {
        handlers.register(
            key,
            Arc::new(CountingHandler {
                calls: handler_calls.clone(),
            }),
        );
    }
    let links = Arc::new(Mutex::new(LinkCodeRegistry::new()));
    handlers.register(
        "link begin",
        LinkBeginHandler::new(links.clone(), clock.clone()),
    );
    handlers.register(
        "link finish",
        LinkFinishHandler::new(links, identities.clone(), clock.clone()),
    );

    let mut outbox_config = OutboxConfig::default();
    outbox_config.max_attempts_result = 3;

    let pipeline = CommandPipeline::new(
        lane.clone(),
        journal.clone(),
        ledger,
        identities,
        policy,
        outbox.clone(),
        handlers,
        clock.clone(),
        pipeline_config,
        outbox_config.clone(),
    );

    Harness {
        pipeline,
        clock,
        journal,
        outbox,
        lane,
        handler_calls,
        outbox_config,
        _dir: dir,
    }
}

fn envelope(binding_id: &str, actor: &str, text: &str, idem_key: &str, now_ms: i64) -> InboundEnvelope {
    InboundEnvelope {
        v: ENVELOPE_VERSION,
        received_at_ms: now_ms,
        request_id: format!("req-{idem_key}-{now_ms}"),
        delivery_id: format!("del-{idem_key}-{now_ms}"),
        channel: Channel::Slack,
        channel_tenant_id: "T1".into(),
        channel_conversation_id: "C1".into(),
        actor_id: actor.to_string(),
        actor_binding_id: binding_id.to_string(),
        assurance_tier: AssuranceTier::TierA,
        repo_root: "/repo".into(),
        command_text: text.to_string(),
        scope_required: String::from("cp.read"),
        scope_effective: String::from("cp.read"),
        target_type: String::new(),
        target_id: None,
        idempotency_key: idem_key.to_string(),
        fingerprint: fingerprint(Channel::Slack, "T1", "C1", actor, text),
        metadata: serde_json::json!({}),
    }
}

fn lifecycle_states(journal: &Arc<Mutex<CommandJournal>>, command_id: &str) -> Vec<String> {
    journal
        .lock()
        .unwrap()
        .history(command_id)
        .unwrap()
        .into_iter()
        .filter_map(|e| match e {
            JournalEntry::CommandLifecycle { command, .. } => Some(command.state.as_str().to_string()),
            JournalEntry::DomainMutating { .. } => None,
        })
        .collect()
}

#[tokio::test]
async fn confirmation_happy_path() {
    let h = harness(PipelineConfig::default(), SafetyConfig::default());

    let result = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", "/mu issue close mu-123", "k1", 0))
        .await;
    let command_id = match &result {
        PipelineResult::AwaitingConfirmation { command_id, .. } => command_id.clone(),
        other => panic!("expected awaiting_confirmation, got {other:?}"),
    };
    assert_eq!(
        lifecycle_states(&h.journal, &command_id),
        vec!["accepted", "awaiting_confirmation"]
    );
    assert_eq!(h.handler_calls.load(Ordering::SeqCst), 0);

    let result = h
        .pipeline
        .handle_inbound(envelope(
            "bind-a",
            "U-alice",
            &format!("/mu confirm {command_id}"),
            "k1-confirm",
            10,
        ))
        .await;
    assert!(matches!(result, PipelineResult::Completed { .. }));
    assert_eq!(
        lifecycle_states(&h.journal, &command_id),
        vec![
            "accepted",
            "awaiting_confirmation",
            "queued",
            "in_progress",
            "completed"
        ]
    );
    assert_eq!(h.handler_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn confirmation_timeout_expires_without_running_handler() {
    let mut cfg = PipelineConfig::default();
    cfg.confirmation_ttl_ms = 30;
    let h = harness(cfg, SafetyConfig::default());

    let result = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", "/mu issue close mu-9", "k1", 0))
        .await;
    let command_id = result.command_id().unwrap().to_string();

    h.clock.advance(50);
    let result = h
        .pipeline
        .handle_inbound(envelope(
            "bind-a",
            "U-alice",
            &format!("confirm {command_id}"),
            "k2",
            50,
        ))
        .await;
    assert!(matches!(result, PipelineResult::Expired { .. }));

    let record = h.journal.lock().unwrap().get(&command_id).cloned().unwrap();
    assert_eq!(record.state, CommandState::Expired);
    assert_eq!(record.error_code.as_deref(), Some("confirmation_expired"));
    assert_eq!(h.handler_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cross_actor_confirm_is_denied() {
    let h = harness(PipelineConfig::default(), SafetyConfig::default());

    let result = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", "/mu issue close mu-1", "k1", 0))
        .await;
    let command_id = result.command_id().unwrap().to_string();

    let result = h
        .pipeline
        .handle_inbound(envelope(
            "bind-b",
            "U-bob",
            &format!("confirm {command_id}"),
            "k2",
            5,
        ))
        .await;
    match result {
        PipelineResult::Denied { reason, .. } => assert_eq!(reason, "confirmation_invalid_actor"),
        other => panic!("expected denial, got {other:?}"),
    }
    let record = h.journal.lock().unwrap().get(&command_id).cloned().unwrap();
    assert_eq!(record.state, CommandState::AwaitingConfirmation);
    assert_eq!(h.handler_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn duplicate_submission_returns_same_command_and_conflict_on_mismatch() {
    let h = harness(PipelineConfig::default(), SafetyConfig::default());
    let text = "mu! run resume mu-root-abc";

    let first = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", text, "same-key", 0))
        .await;
    let second = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", text, "same-key", 5))
        .await;

    let (id1, id2) = match (&first, &second) {
        (
            PipelineResult::AwaitingConfirmation { command_id: a, .. },
            PipelineResult::AwaitingConfirmation { command_id: b, .. },
        ) => (a.clone(), b.clone()),
        other => panic!("expected two awaiting results, got {other:?}"),
    };
    assert_eq!(id1, id2);
    assert_eq!(h.handler_calls.load(Ordering::SeqCst), 0);

    // Same key, different content → conflict.
    let third = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", "mu! forum post hello", "same-key", 10))
        .await;
    match third {
        PipelineResult::Denied { reason, .. } => assert_eq!(reason, "idempotency_conflict"),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_defers_third_mutation() {
    let mut safety = SafetyConfig::default();
    safety.window_ms = 60_000;
    safety.actor_limit = 2;
    safety.defer_ms = 5_000;
    let h = harness(PipelineConfig::default(), safety);

    for i in 0..2 {
        let result = h
            .pipeline
            .handle_inbound(envelope(
                "bind-a",
                "U-alice",
                &format!("/mu forum post update-{i}"),
                &format!("k{i}"),
                0,
            ))
            .await;
        assert!(
            matches!(result, PipelineResult::Completed { .. }),
            "post {i} should complete, got {result:?}"
        );
    }

    let result = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", "/mu forum post update-3", "k3", 0))
        .await;
    match result {
        PipelineResult::Deferred { retry_at_ms, command_id } => {
            assert_eq!(retry_at_ms, 5_000);
            assert_eq!(
                lifecycle_states(&h.journal, &command_id),
                vec!["accepted", "queued", "deferred"]
            );
        }
        other => panic!("expected deferred, got {other:?}"),
    }
    assert_eq!(h.handler_calls.load(Ordering::SeqCst), 2);

    // After the retry time the deferred command becomes eligible and runs.
    h.clock.set(61_000);
    let polled = h.pipeline.poll_deferred().await;
    assert_eq!(polled, 1);
    assert_eq!(h.handler_calls.load(Ordering::SeqCst), 3);
}

struct ScriptedDeliverer {
    outcomes: Mutex<Vec<DeliveryOutcome>>,
}

#[async_trait]
impl Deliverer for ScriptedDeliverer {
    async fn deliver(&self, _envelope: &OutboundEnvelope) -> DeliveryOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(DeliveryOutcome::Delivered)
    }
}

#[tokio::test]
async fn dlq_replay_preserves_correlation() {
    let h = harness(PipelineConfig::default(), SafetyConfig::default());

    let result = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", "/mu status", "k1", 0))
        .await;
    let command_id = result.command_id().unwrap().to_string();

    // Three failed attempts exhaust the result budget (3 in this harness).
    let dispatcher = OutboxDispatcher::new(
        h.outbox.clone(),
        h.lane.clone(),
        Arc::new(ScriptedDeliverer {
            outcomes: Mutex::new(vec![
                DeliveryOutcome::Retry { error: "http 503".into(), retry_delay_ms: Some(1) },
                DeliveryOutcome::Retry { error: "http 503".into(), retry_delay_ms: Some(1) },
                DeliveryOutcome::Retry { error: "http 503".into(), retry_delay_ms: Some(1) },
            ]),
        }),
        h.clock.clone(),
        h.outbox_config.clone(),
    );
    for _ in 0..3 {
        dispatcher.drain_due().await;
        h.clock.advance(10);
    }

    let dead = h.outbox.lock().unwrap().dead_letters();
    let result_record = dead
        .iter()
        .find(|r| r.envelope.kind == EnvelopeKind::Result)
        .expect("result envelope should be dead-lettered")
        .clone();
    assert_eq!(result_record.attempt_count, 3);
    assert_eq!(
        result_record.envelope.correlation.command_id.as_deref(),
        Some(command_id.as_str())
    );

    // Replay: fresh pending record, correlation preserved, delivery succeeds.
    let replayed = h
        .outbox
        .lock()
        .unwrap()
        .replay(result_record.outbox_id.as_str(), h.clock.now_ms())
        .unwrap();
    assert_eq!(
        replayed.replay_of_outbox_id.as_deref(),
        Some(result_record.outbox_id.as_str())
    );
    assert_eq!(
        replayed.envelope.correlation.command_id.as_deref(),
        Some(command_id.as_str())
    );

    dispatcher.drain_due().await;
    let record = h
        .outbox
        .lock()
        .unwrap()
        .get(replayed.outbox_id.as_str())
        .cloned()
        .unwrap();
    assert_eq!(record.state, OutboxState::Delivered);
}

#[tokio::test]
async fn cancel_before_confirmation_cancels() {
    let h = harness(PipelineConfig::default(), SafetyConfig::default());
    let result = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", "/mu issue close mu-5", "k1", 0))
        .await;
    let command_id = result.command_id().unwrap().to_string();

    let result = h
        .pipeline
        .handle_inbound(envelope(
            "bind-a",
            "U-alice",
            &format!("/mu cancel {command_id}"),
            "k2",
            5,
        ))
        .await;
    assert!(matches!(result, PipelineResult::Cancelled { .. }));
    let record = h.journal.lock().unwrap().get(&command_id).cloned().unwrap();
    assert_eq!(record.state, CommandState::Cancelled);
    assert!(record.terminal_at_ms.is_some());
    assert_eq!(h.handler_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_binding_is_denied_but_link_begin_is_reachable() {
    let h = harness(PipelineConfig::default(), SafetyConfig::default());
    let result = h
        .pipeline
        .handle_inbound(envelope("bind-ghost", "U-ghost", "/mu status", "k1", 0))
        .await;
    match result {
        PipelineResult::Denied { reason, .. } => assert_eq!(reason, "identity_not_linked"),
        other => panic!("{other:?}"),
    }

    // The link bootstrap still works for the unlinked actor.
    let result = h
        .pipeline
        .handle_inbound(envelope("bind-ghost", "U-ghost", "/mu link begin", "k2", 0))
        .await;
    match result {
        PipelineResult::Completed { result, .. } => {
            assert!(result.get("link_code").and_then(|v| v.as_str()).is_some());
        }
        other => panic!("expected completed link begin, got {other:?}"),
    }
}

#[tokio::test]
async fn restart_reconstructs_journal_state() {
    let h = harness(PipelineConfig::default(), SafetyConfig::default());
    let result = h
        .pipeline
        .handle_inbound(envelope("bind-a", "U-alice", "/mu status", "k1", 0))
        .await;
    let command_id = result.command_id().unwrap().to_string();

    let reloaded = CommandJournal::open(h._dir.path()).unwrap();
    let record = reloaded.get(&command_id).unwrap();
    assert_eq!(record.state, CommandState::Completed);
    assert_eq!(record.attempt, 1);
}
