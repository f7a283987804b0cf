use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

/// GET /healthz — liveness only; readiness is the `ready` command.
pub async fn healthz() -> Json<Value> {
    Json(json!({"ok": true}))
}

/// Everything outside the control-plane surface.
pub async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
}
