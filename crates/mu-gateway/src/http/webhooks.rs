//! Adapter ingress endpoint — POST /webhooks/{adapter}.
//!
//! The handler pins the current adapter generation for its whole lifetime
//! (blue/green: an in-flight request keeps verifying against the secrets it
//! started with) and counts toward the reload drain gauge.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use mu_adapters::AckContext;
use mu_outbox::present;

use crate::app::AppState;

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(adapter_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let route = format!("/webhooks/{adapter_name}");
    // Pin this generation's adapter set and count the in-flight request.
    let adapters = state.generations.current();
    let _guard = state.generations.begin_request();

    let Some(adapter) = adapters.by_route(&route) else {
        warn!(route = %route, "unknown webhook route");
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown adapter route"})),
        ));
    };

    let header_map = lowercase_headers(&headers);
    let lookup = state.binding_lookup();
    let envelope = adapter
        .verify_and_normalize(
            &header_map,
            &body,
            state.clock.now_ms(),
            &state.config.repo_root,
            &lookup,
        )
        .map_err(|e| {
            warn!(route = %route, error = %e, "webhook rejected");
            (
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
                Json(json!({"error": e.code()})),
            )
        })?;

    let conversation = envelope.channel_conversation_id.clone();
    let intent = if envelope.target_type.is_empty() {
        envelope.command_text.clone()
    } else {
        envelope.target_type.clone()
    };

    let result = state.pipeline.handle_inbound(envelope).await;
    info!(route = %route, state = result.state_str(), command_id = ?result.command_id(), "webhook handled");

    // Compact ACK now; the detailed body rides the outbox.
    let compact = present::present(&intent, result.state_str(), result.reason(), None).compact;
    let ack = adapter.render_ack(AckContext {
        state: result.state_str(),
        reason: result.reason(),
        command_id: result.command_id(),
        compact: &compact,
        conversation_id: &conversation,
    });
    Ok(Json(ack))
}

fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}
