use crate::error::ApiError;
use crate::session::RelaySession;
use aam_core::AgentEvent;
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub fn router(session: Arc<RelaySession>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/events", post(post_event))
        .route("/api/stats", get(stats))
        .with_state(session)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(session): State<Arc<RelaySession>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session.handle_socket(socket))
}

async fn health(State(session): State<Arc<RelaySession>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": session.uptime().as_secs_f64(),
        "clients": session.client_count().await,
        "upstream": session.upstream_state().as_str(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Accepts one agent event and fans it out to connected clients. A missing
/// `timestamp` is stamped with the receive time. Anything else the reducer
/// could not fold (no `type` or `agentId`, an unknown kind, `data` of the
/// wrong shape) is a 400.
async fn post_event(
    State(session): State<Arc<RelaySession>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut raw: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::validation(format!("body is not JSON: {err}")))?;
    stamp_missing_timestamp(&mut raw, Utc::now().timestamp_millis());
    let event = AgentEvent::from_value(&raw).map_err(|err| ApiError::validation(err.to_string()))?;
    let clients = session.publish(&event).await;
    info!(
        event = "event_published",
        kind = event.kind().as_str(),
        agent_id = %event.agent_id,
        clients
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({"data": {"sent": true, "clients": clients}})),
    ))
}

fn stamp_missing_timestamp(raw: &mut Value, now_ms: i64) {
    if let Some(object) = raw.as_object_mut() {
        if object.get("timestamp").map_or(true, Value::is_null) {
            object.insert("timestamp".to_string(), Value::from(now_ms));
        }
    }
}

async fn stats(State(session): State<Arc<RelaySession>>) -> Json<Value> {
    Json(json!({
        "data": {
            "connectedClients": session.client_count().await,
            "uptime": session.uptime().as_secs_f64(),
            "memoryUsage": resident_memory_bytes(),
        }
    }))
}

/// Resident set size from `/proc/self/status`; `None` where that file does
/// not exist.
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}
