//! Program wakes and run events flowing back into the core: heartbeat/cron
//! ticks become synthetic inbound envelopes; run supervisor events become
//! outbox deliveries.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use mu_core::envelope::{fingerprint, InboundEnvelope, ENVELOPE_VERSION};
use mu_core::{surface, AssuranceTier, Channel, Clock};
use mu_journal::SerializedMutationExecutor;
use mu_outbox::{present, EnvelopeKind, OutboundEnvelope, OutboxStore};
use mu_pipeline::{CommandPipeline, PipelineResult};
use mu_programs::{WakeDispatcher, WakeRequest, WakeStatus};
use mu_runs::{ControlPlaneRunEvent, RunEventType};

use crate::telemetry::Telemetry;

/// Reserved actor the program registries act as. A binding for it is
/// provisioned at boot.
pub const PROGRAM_ACTOR: &str = "program-scheduler";

/// Turns registry wakes into synthetic inbound envelopes on the internal
/// (neovim-class) channel.
pub struct PipelineWakeDispatcher {
    pipeline: Arc<CommandPipeline>,
    clock: Arc<dyn Clock>,
    repo_root: String,
    binding_id: String,
}

impl PipelineWakeDispatcher {
    pub fn new(
        pipeline: Arc<CommandPipeline>,
        clock: Arc<dyn Clock>,
        repo_root: String,
        binding_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            clock,
            repo_root,
            binding_id,
        })
    }

    fn envelope_for(&self, wake: &WakeRequest) -> InboundEnvelope {
        let raw = wake
            .target
            .clone()
            .or_else(|| wake.prompt.clone())
            .unwrap_or_else(|| "status".to_string());
        let command_text = if raw.starts_with("/mu") || raw.starts_with("mu") {
            raw
        } else {
            format!("/mu {raw}")
        };

        let (target_type, target_id) = match surface::parse_command_text(&command_text) {
            Some(parsed) => (parsed.target_type, parsed.target_id),
            None => (String::new(), None),
        };
        let request_id = format!("{}:{}", wake.dedupe_key, wake.scheduled_for_ms);

        InboundEnvelope {
            v: ENVELOPE_VERSION,
            received_at_ms: self.clock.now_ms(),
            request_id: request_id.clone(),
            delivery_id: request_id.clone(),
            channel: Channel::Neovim,
            channel_tenant_id: "programs".to_string(),
            channel_conversation_id: wake.program_id.clone(),
            actor_id: PROGRAM_ACTOR.to_string(),
            actor_binding_id: self.binding_id.clone(),
            assurance_tier: AssuranceTier::TierB,
            repo_root: self.repo_root.clone(),
            command_text: command_text.clone(),
            scope_required: "cp.read".to_string(),
            scope_effective: "cp.read".to_string(),
            target_type,
            target_id,
            idempotency_key: request_id,
            fingerprint: fingerprint(
                Channel::Neovim,
                "programs",
                &wake.program_id,
                PROGRAM_ACTOR,
                &command_text,
            ),
            metadata: wake.metadata.clone(),
        }
    }
}

#[async_trait]
impl WakeDispatcher for PipelineWakeDispatcher {
    async fn dispatch_wake(&self, wake: WakeRequest) -> WakeStatus {
        let envelope = self.envelope_for(&wake);
        debug!(program_id = %wake.program_id, kind = wake.kind, "dispatching program wake");
        match self.pipeline.handle_inbound(envelope).await {
            PipelineResult::Denied { reason, .. } => WakeStatus::Failed { reason },
            PipelineResult::Failed { error_code, .. } => WakeStatus::Failed { reason: error_code },
            PipelineResult::Deferred { .. } => WakeStatus::Coalesced {
                reason: "backpressure_deferred".to_string(),
            },
            _ => WakeStatus::Ok,
        }
    }
}

/// Consume run supervisor events and enqueue them for delivery. Events
/// without a chat route (API launches) are counted as dropped signals.
pub fn spawn_run_event_pump(
    mut events: mpsc::UnboundedReceiver<ControlPlaneRunEvent>,
    outbox: Arc<Mutex<OutboxStore>>,
    lane: Arc<SerializedMutationExecutor>,
    telemetry: Arc<Telemetry>,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    const RUN_EVENT_MAX_ATTEMPTS: u32 = 6;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(route) = event.route.clone() else {
                telemetry.drop_signal_total.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let kind = match event.event_type {
                RunEventType::RunCompleted => EnvelopeKind::Result,
                RunEventType::RunFailed => EnvelopeKind::Error,
                _ => EnvelopeKind::Lifecycle,
            };
            let detail = serde_json::to_string_pretty(&event.payload).unwrap_or_default();
            let message = present::present("run", event.event_type.as_str(), None, Some(&detail));

            let envelope = OutboundEnvelope {
                channel: route.channel,
                channel_tenant_id: route.channel_tenant_id,
                channel_conversation_id: route.channel_conversation_id,
                kind,
                body: message.detailed,
                correlation: event.correlation.clone(),
                metadata: serde_json::json!({"job_id": event.job_id, "seq": event.seq}),
            };

            let dedupe_key = event.dedupe_key();
            let now = clock.now_ms();
            let outbox = outbox.clone();
            let enqueued = lane
                .run(|| async move {
                    outbox.lock().unwrap().enqueue_status(
                        envelope,
                        &dedupe_key,
                        RUN_EVENT_MAX_ATTEMPTS,
                        now,
                    )
                })
                .await;
            match enqueued {
                Ok((_, created)) => {
                    if !created {
                        telemetry.duplicate_signal_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => error!(error = %e, "failed to enqueue run event"),
            }
        }
        debug!("run event pump stopped");
    })
}
