use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::master::{MasterContext, WorkerRecord};
use crate::repo::{render_unified, RepoReader};
use crate::worker::{Session, WorkerEvent};

pub async fn health(State(ctx): State<Arc<MasterContext>>) -> impl IntoResponse {
    let (workers, sessions, events) = ctx.aggregator.event_counts().await;
    Json(json!({ "status": "ok", "workers": workers, "sessions": sessions, "events": events }))
}

pub async fn worker_events(State(ctx): State<Arc<MasterContext>>, body: axum::body::Bytes) -> impl IntoResponse {
    match serde_json::from_slice::<WorkerEvent>(&body) {
        Ok(event) => {
            ctx.aggregator.ingest_event(event).await;
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}

pub async fn worker_sync(State(ctx): State<Arc<MasterContext>>, body: axum::body::Bytes) -> impl IntoResponse {
    match serde_json::from_slice::<crate::master::WorkerSyncBody>(&body) {
        Ok(sync) => {
            ctx.aggregator.sync(sync).await;
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}

fn worker_json(w: &WorkerRecord, now: chrono::DateTime<Utc>) -> Value {
    json!({
        "id": w.id,
        "status": w.status_at(now),
        // Empty string, not null — the wire contract's explicit-offline marker.
        "lastHeartbeat": w.last_heartbeat.map(|t| t.to_rfc3339()).unwrap_or_default(),
        "registeredAt": w.registered_at,
        "sessionCount": w.session_count,
        "hostInfo": w.host_info,
    })
}

pub async fn workers(State(ctx): State<Arc<MasterContext>>) -> impl IntoResponse {
    let now = Utc::now();
    let list: Vec<Value> = ctx.aggregator.workers().await.iter().map(|w| worker_json(w, now)).collect();
    Json(json!({ "workers": list }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    limit: Option<usize>,
    before: Option<String>,
}

pub async fn events(State(ctx): State<Arc<MasterContext>>, Query(q): Query<EventsQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50).min(200);
    let before = q.before.as_deref().and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc));
    let (events, has_more, total) = ctx.aggregator.events_page(limit, before).await;
    Json(json!({ "events": events, "hasMore": has_more, "total": total }))
}

pub async fn state(State(ctx): State<Arc<MasterContext>>) -> impl IntoResponse {
    let now = Utc::now();
    let workers: Vec<Value> = ctx.aggregator.workers().await.iter().map(|w| worker_json(w, now)).collect();
    let sessions = ctx.aggregator.sessions().await;
    let recent = ctx.aggregator.recent_events(20).await;
    Json(json!({ "workers": workers, "sessions": sessions, "recentEvents": recent }))
}

/// Merge the worker-reported `Session` with any live WS-session fields,
/// surfacing `pendingToolApproval` as `pendingApproval` per the REST shape.
async fn merged_session_json(ctx: &MasterContext, session: &Session) -> Value {
    let mut v = serde_json::to_value(session).unwrap_or(Value::Null);
    if let Some(ws) = ctx.sessions.get_session_state(&session.session_name).await {
        if let (Value::Object(map), Ok(Value::Object(ws_map))) = (&mut v, serde_json::to_value(&ws)) {
            for (k, val) in ws_map {
                if k == "pendingToolApproval" {
                    if !val.is_null() {
                        map.insert("pendingApproval".to_string(), val);
                    }
                } else {
                    map.insert(k, val);
                }
            }
        }
    }
    v
}

pub async fn sessions_list(State(ctx): State<Arc<MasterContext>>) -> impl IntoResponse {
    let sessions = ctx.aggregator.sessions().await;
    let mut out = Vec::with_capacity(sessions.len());
    for s in &sessions {
        out.push(merged_session_json(&ctx, s).await);
    }
    Json(json!({ "sessions": out }))
}

pub async fn send_message(State(ctx): State<Arc<MasterContext>>, Path(name): Path<String>, Json(body): Json<Value>) -> impl IntoResponse {
    let Some(text) = body.get("text").and_then(Value::as_str) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "text is required and must be a string" })));
    };

    if ctx.sessions.send_user_message(&name, text).await {
        (StatusCode::OK, Json(json!({ "success": true, "method": "websocket" })))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "success": false, "error": "session not connected" })))
    }
}

pub async fn approve_tool(State(ctx): State<Arc<MasterContext>>, Path(name): Path<String>, Json(body): Json<Value>) -> impl IntoResponse {
    let Some(request_id) = body.get("requestId").and_then(Value::as_str) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "requestId is required" })));
    };
    let allow = match body.get("action").and_then(Value::as_str) {
        Some("allow") => true,
        Some("deny") => false,
        _ => return (StatusCode::BAD_REQUEST, Json(json!({ "error": "action must be \"allow\" or \"deny\"" }))),
    };
    let message = body.get("message").and_then(Value::as_str).map(String::from);

    if ctx.sessions.respond_to_tool_approval(&name, request_id, allow, message).await {
        (StatusCode::OK, Json(json!({ "success": true })))
    } else {
        (StatusCode::BAD_REQUEST, Json(json!({ "success": false, "error": "no pending approval for that requestId" })))
    }
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    file: Option<String>,
}

pub async fn diff(State(ctx): State<Arc<MasterContext>>, Path(name): Path<String>, Query(q): Query<DiffQuery>) -> impl IntoResponse {
    let sessions = ctx.aggregator.sessions().await;
    let Some(session) = sessions.iter().find(|s| s.session_name == name) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown session" })));
    };
    let Some(repo_path) = &session.worktree_path else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "session has no known worktree path" })));
    };

    let result = match &q.file {
        Some(file) => RepoReader::file_diff(repo_path, file, false).await.map(|fd| render_unified(&[fd])),
        None => RepoReader::diff(repo_path).await.map(|diffs| render_unified(&diffs)),
    };

    match result {
        Ok(text) => (StatusCode::OK, Json(json!({ "diff": text }))),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))),
    }
}

pub async fn auth_setup(State(ctx): State<Arc<MasterContext>>) -> impl IntoResponse {
    match ctx.tokens.get_or_create() {
        Ok(token) => (StatusCode::OK, Json(json!({ "token": token }))),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))),
    }
}

pub async fn auth_validate(State(ctx): State<Arc<MasterContext>>, Json(body): Json<Value>) -> impl IntoResponse {
    let token = body.get("token").and_then(Value::as_str).unwrap_or("");
    Json(json!({ "valid": ctx.tokens.validate(token) }))
}

async fn config_json(ctx: &MasterContext) -> Value {
    let sessions = ctx.aggregator.sessions().await;
    let projects: Vec<&str> = {
        let mut p: Vec<&str> = sessions.iter().filter_map(|s| s.project_name.as_deref()).collect();
        p.sort_unstable();
        p.dedup();
        p
    };
    let hosts: Vec<String> = ctx.aggregator.workers().await.into_iter().map(|w| w.id).collect();
    let rules = ctx.rule_engine.read().await.rules().to_vec();

    json!({
        "config": {
            "projects": projects,
            "hosts": hosts,
            "toolApprovalRules": rules,
            "hasLinear": false,
        }
    })
}

pub async fn get_config(State(ctx): State<Arc<MasterContext>>) -> impl IntoResponse {
    Json(config_json(&ctx).await)
}

pub async fn patch_config(State(ctx): State<Arc<MasterContext>>, Json(body): Json<Value>) -> impl IntoResponse {
    if let Some(rules_val) = body.get("toolApprovalRules") {
        match serde_json::from_value(rules_val.clone()) {
            Ok(rules) => ctx.rule_engine.write().await.set_rules(rules),
            Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
        }
    }
    (StatusCode::OK, Json(config_json(&ctx).await))
}
