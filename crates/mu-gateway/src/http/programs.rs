use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use mu_programs::{CronProgram, HeartbeatProgram};

use crate::app::AppState;

// ── heartbeats ────────────────────────────────────────────────────────────────

pub async fn heartbeats_list(State(state): State<Arc<AppState>>) -> Json<Value> {
    let programs = state.heartbeats.list();
    let programs: Vec<Value> = programs
        .into_iter()
        .map(|p| {
            let last = state.heartbeats.last_tick(&p.program_id);
            json!({"program": p, "last_tick": last})
        })
        .collect();
    Json(json!({"programs": programs}))
}

pub async fn heartbeats_upsert(
    State(state): State<Arc<AppState>>,
    Json(program): Json<HeartbeatProgram>,
) -> (StatusCode, Json<Value>) {
    match state.heartbeats.upsert(program) {
        Ok(program) => (StatusCode::OK, Json(json!({"ok": true, "program": program}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": e.code(), "detail": e.to_string()})),
        ),
    }
}

pub async fn heartbeats_remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.heartbeats.remove(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": e.code()})),
        ),
    }
}

// ── cron ──────────────────────────────────────────────────────────────────────

pub async fn cron_list(State(state): State<Arc<AppState>>) -> Json<Value> {
    let programs: Vec<Value> = state
        .crons
        .list()
        .into_iter()
        .map(|p| {
            let next = state.crons.next_fire(&p.program_id);
            let last = state.crons.last_tick(&p.program_id);
            json!({"program": p, "next_fire_ms": next, "last_tick": last})
        })
        .collect();
    Json(json!({"programs": programs}))
}

pub async fn cron_upsert(
    State(state): State<Arc<AppState>>,
    Json(program): Json<CronProgram>,
) -> (StatusCode, Json<Value>) {
    match state.crons.upsert(program) {
        Ok(program) => (StatusCode::OK, Json(json!({"ok": true, "program": program}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": e.code(), "detail": e.to_string()})),
        ),
    }
}

pub async fn cron_remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.crons.remove(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": e.code()})),
        ),
    }
}
