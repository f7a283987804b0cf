use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;
use crate::telemetry::GateThresholds;

/// GET /api/control-plane/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let adapters = state.generations.current();
    let gate = state.telemetry.evaluate_gate(&GateThresholds::default());

    Json(json!({
        "repo_root": state.config.repo_root,
        "control_plane": {
            "active": true,
            "adapters": adapters.channels(),
            "routes": adapters.routes(),
            "generation": state.generations.generation(),
            "observability": {
                "counters": {
                    "pipeline": state.pipeline.counters().snapshot(),
                    "telemetry": state.telemetry.snapshot(),
                },
                "gate": gate,
            },
        },
        "last_reload": state.generations.last_reload(),
    }))
}
