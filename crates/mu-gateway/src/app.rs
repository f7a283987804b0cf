use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mu_adapters::{AdapterSet, BindingLookup};
use mu_core::{AssuranceTier, Channel, Clock, MuConfig};
use mu_identity::{IdentityBinding, IdentityStore, LinkCodeRegistry};
use mu_journal::{
    CommandJournal, IdempotencyLedger, SerializedMutationExecutor, WriterLock,
};
use mu_outbox::{Deliverer, OutboxDispatcher, OutboxStore};
use mu_pipeline::identity_handlers::{
    GrantScopeHandler, LinkBeginHandler, LinkFinishHandler, RevokeHandler, UnlinkSelfHandler,
};
use mu_pipeline::{CliBridgeHandler, CommandPipeline, HandlerRegistry, SubprocessCliRunner};
use mu_policy::{PolicyEngine, PolicySet};
use mu_programs::{CronProgramRegistry, HeartbeatProgramRegistry};
use mu_runs::RunSupervisor;

use crate::generation::GenerationSupervisor;
use crate::telemetry::Telemetry;
use crate::tooling::{
    AuditGetHandler, DlqInspectHandler, DlqListHandler, DlqReplayHandler, KillSwitchHandler,
    OperatorTooling, PolicyUpdateHandler, RateLimitOverrideHandler, ReadyHandler,
    RunTriggerHandler, RuntimeStatusHandler,
};
use crate::wake::{spawn_run_event_pump, PipelineWakeDispatcher, PROGRAM_ACTOR};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: MuConfig,
    pub config_path: Option<String>,
    pub clock: Arc<dyn Clock>,
    pub pipeline: Arc<CommandPipeline>,
    pub generations: Arc<GenerationSupervisor>,
    pub telemetry: Arc<Telemetry>,
    pub runs: Arc<RunSupervisor>,
    pub heartbeats: Arc<HeartbeatProgramRegistry>,
    pub crons: Arc<CronProgramRegistry>,
    pub tooling: Arc<OperatorTooling>,
    pub identities: Arc<Mutex<IdentityStore>>,
    pub writer_lock: Arc<Mutex<Option<WriterLock>>>,
    pub dispatcher: Arc<OutboxDispatcher>,
}

/// Hot-path binding lookup the adapters use during normalization.
pub struct IdentityBindingLookup {
    identities: Arc<Mutex<IdentityStore>>,
}

impl BindingLookup for IdentityBindingLookup {
    fn lookup(&self, channel: Channel, actor_id: &str) -> Option<(String, AssuranceTier)> {
        self.identities
            .lock()
            .unwrap()
            .find_by_actor(channel, actor_id)
            .map(|b| (b.binding_id.clone(), b.assurance_tier))
    }
}

impl AppState {
    pub fn binding_lookup(&self) -> IdentityBindingLookup {
        IdentityBindingLookup {
            identities: self.identities.clone(),
        }
    }
}

/// Wire the whole control plane. Order matters: stores first, then policy
/// and the run supervisor, then the pipeline with its handler registry, and
/// only then the tooling façade that needs both ends.
pub fn build_state(
    config: MuConfig,
    config_path: Option<String>,
    clock: Arc<dyn Clock>,
    writer_lock: Arc<Mutex<Option<WriterLock>>>,
    deliverer: Arc<dyn Deliverer>,
) -> anyhow::Result<Arc<AppState>> {
    let store_dir = config.store_path();
    std::fs::create_dir_all(&store_dir)?;

    let lane = SerializedMutationExecutor::new();
    let journal = Arc::new(Mutex::new(CommandJournal::open(&store_dir)?));
    let ledger = Arc::new(Mutex::new(IdempotencyLedger::open(&store_dir)?));
    let outbox = Arc::new(Mutex::new(OutboxStore::open(&store_dir)?));

    let mut identity_store = IdentityStore::open(&store_dir)?;
    let program_binding_id = provision_program_binding(&mut identity_store, clock.now_ms())?;
    let identities = Arc::new(Mutex::new(identity_store));

    let policy = Arc::new(Mutex::new(PolicyEngine::new(PolicySet::from_config(
        &config.safety,
    ))));
    let telemetry = Telemetry::new();

    let generations = GenerationSupervisor::new(
        AdapterSet::from_config(&config.adapters),
        telemetry.clone(),
        clock.clone(),
        5_000,
    );

    let (run_events_tx, run_events_rx) = mpsc::unbounded_channel();
    let runs = RunSupervisor::new(
        config
            .cli
            .binary
            .clone()
            .unwrap_or_else(|| "mu".to_string()),
        config.runs.clone(),
        clock.clone(),
        run_events_tx,
    );

    // Handler registry: builtins, CLI bridge, identity lifecycle, run
    // triggers, and operator controls.
    let links = Arc::new(Mutex::new(LinkCodeRegistry::new()));
    let cli_runner = SubprocessCliRunner::new(config.cli.clone());
    let cli_bridge = CliBridgeHandler::new(cli_runner);

    let handlers = HandlerRegistry::new();
    for key in [
        "issue get",
        "issue list",
        "issue create",
        "issue update",
        "issue claim",
        "issue close",
        "issue dep add",
        "issue dep remove",
        "forum read",
        "forum post",
    ] {
        handlers.register(key, cli_bridge.clone());
    }
    handlers.register("link begin", LinkBeginHandler::new(links.clone(), clock.clone()));
    handlers.register(
        "link finish",
        LinkFinishHandler::new(links, identities.clone(), clock.clone()),
    );
    handlers.register("unlink self", UnlinkSelfHandler::new(identities.clone()));
    handlers.register("revoke", RevokeHandler::new(identities.clone()));
    handlers.register("grant scope", GrantScopeHandler::new(identities.clone()));
    handlers.register(
        "run start",
        RunTriggerHandler::new(runs.clone(), config.operator.run_triggers_enabled),
    );
    handlers.register(
        "run resume",
        RunTriggerHandler::new(runs.clone(), config.operator.run_triggers_enabled),
    );
    handlers.register("ready", ReadyHandler::new(writer_lock.clone()));
    handlers.register("audit get", AuditGetHandler::new(journal.clone()));
    handlers.register("dlq list", DlqListHandler::new(outbox.clone()));
    handlers.register("dlq inspect", DlqInspectHandler::new(outbox.clone()));
    handlers.register(
        "dlq replay",
        DlqReplayHandler::new(outbox.clone(), clock.clone()),
    );
    handlers.register("kill-switch set", KillSwitchHandler::new(policy.clone()));
    handlers.register(
        "rate-limit override",
        RateLimitOverrideHandler::new(policy.clone()),
    );
    handlers.register("policy update", PolicyUpdateHandler::new(policy.clone()));

    let pipeline = CommandPipeline::new(
        lane.clone(),
        journal.clone(),
        ledger,
        identities.clone(),
        policy.clone(),
        outbox.clone(),
        handlers.clone(),
        clock.clone(),
        config.pipeline.clone(),
        config.outbox.clone(),
    );

    // Registry clones share one table, so the status builtin can land after
    // the pipeline exists.
    handlers.register(
        "status",
        RuntimeStatusHandler::new(
            generations.clone(),
            telemetry.clone(),
            pipeline.counters(),
            runs.clone(),
            outbox.clone(),
        ),
    );

    let tooling = OperatorTooling::new(
        journal.clone(),
        outbox.clone(),
        policy.clone(),
        lane.clone(),
        clock.clone(),
    );

    let wake_dispatcher = PipelineWakeDispatcher::new(
        pipeline.clone(),
        clock.clone(),
        config.repo_root.clone(),
        program_binding_id,
    );
    let heartbeats = HeartbeatProgramRegistry::new(wake_dispatcher.clone(), clock.clone());
    let crons = CronProgramRegistry::new(
        wake_dispatcher,
        clock.clone(),
        config.programs.cron_horizon_minutes,
    );

    let dispatcher = OutboxDispatcher::new(
        outbox.clone(),
        lane.clone(),
        deliverer,
        clock.clone(),
        config.outbox.clone(),
    );

    spawn_run_event_pump(
        run_events_rx,
        outbox.clone(),
        lane.clone(),
        telemetry.clone(),
        clock.clone(),
    );

    let state = Arc::new(AppState {
        config,
        config_path,
        clock,
        pipeline,
        generations,
        telemetry,
        runs,
        heartbeats,
        crons,
        tooling,
        identities,
        writer_lock,
        dispatcher,
    });
    Ok(state)
}

/// Identity row the program registries act through.
fn provision_program_binding(
    identities: &mut IdentityStore,
    now_ms: i64,
) -> anyhow::Result<String> {
    if let Some(existing) = identities.find_by_actor(Channel::Neovim, PROGRAM_ACTOR) {
        return Ok(existing.binding_id.clone());
    }
    let binding = IdentityBinding {
        binding_id: "bind-program-scheduler".to_string(),
        channel: Channel::Neovim,
        channel_tenant_id: "programs".to_string(),
        actor_id: PROGRAM_ACTOR.to_string(),
        display_name: "program scheduler".to_string(),
        scopes: vec![
            "cp.read".to_string(),
            "cp.run.write".to_string(),
            "cp.forum.write".to_string(),
        ],
        assurance_tier: AssuranceTier::TierB,
        linked_at_ms: now_ms,
        revoked: false,
    };
    info!(binding_id = %binding.binding_id, "provisioned program scheduler binding");
    identities.upsert(binding.clone())?;
    Ok(binding.binding_id)
}

/// Long-running loops: outbox dispatcher, program registries, deferred
/// command poller. All stop when the shutdown watch flips.
pub fn spawn_background(state: &Arc<AppState>) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    handles.push(tokio::spawn(
        state.dispatcher.clone().run(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(
        state.heartbeats.clone().run(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(state.crons.clone().run(shutdown_rx.clone())));

    // Deferred commands become eligible on their retry time.
    let pipeline = state.pipeline.clone();
    let mut deferred_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = interval.tick() => { pipeline.poll_deferred().await; }
                _ = deferred_shutdown.changed() => {
                    if *deferred_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    (shutdown_tx, handles)
}

/// Assemble the control-plane router. Non-control-plane routes 404.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::http::health::healthz))
        .route("/api/control-plane/status", get(crate::http::status::status))
        .route("/api/control-plane/reload", post(crate::http::reload::reload))
        .route(
            "/api/control-plane/rollback",
            post(crate::http::reload::rollback),
        )
        .route(
            "/api/heartbeats",
            get(crate::http::programs::heartbeats_list).post(crate::http::programs::heartbeats_upsert),
        )
        .route(
            "/api/heartbeats/{id}",
            delete(crate::http::programs::heartbeats_remove),
        )
        .route(
            "/api/cron",
            get(crate::http::programs::cron_list).post(crate::http::programs::cron_upsert),
        )
        .route("/api/cron/{id}", delete(crate::http::programs::cron_remove))
        .route(
            "/webhooks/{adapter}",
            post(crate::http::webhooks::webhook_handler),
        )
        .fallback(crate::http::health::not_found)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Config changes surfaced mid-flight land here (reload endpoint).
pub fn load_config(config_path: Option<&str>) -> MuConfig {
    match MuConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "config reload failed; using defaults");
            MuConfig::default()
        }
    }
}
