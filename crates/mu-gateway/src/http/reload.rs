use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::app::{load_config, AppState};
use crate::generation::ReloadState;

#[derive(Debug, Deserialize)]
pub struct ReloadBody {
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "operator request".to_string()
}

/// POST /api/control-plane/reload — re-read config, warm the next adapter
/// generation, cut over, drain. An empty body means "operator request".
pub async fn reload(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let reason = serde_json::from_slice::<ReloadBody>(&body)
        .map(|b| b.reason)
        .unwrap_or_else(|_| default_reason());
    info!(reason = %reason, "reload requested");

    let next = load_config(state.config_path.as_deref());
    let attempt = state.generations.reload(&next.adapters, &reason).await;
    let ok = attempt.state == ReloadState::Completed;
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(json!({"ok": ok, "attempt": attempt})))
}

/// POST /api/control-plane/rollback — manual return to the prior
/// generation.
pub async fn rollback(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.generations.rollback_manual() {
        Ok(attempt) => (StatusCode::OK, Json(json!({"ok": true, "attempt": attempt}))),
        Err(reason) => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "error": reason})),
        ),
    }
}
