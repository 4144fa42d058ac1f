//! REST, SSE, and CLI-facing WebSocket surface.

pub mod handlers;
pub mod sse;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::master::MasterContext;

pub fn router(ctx: Arc<MasterContext>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/worker-events", post(handlers::worker_events))
        .route("/api/worker-sync", post(handlers::worker_sync))
        .route("/api/workers", get(handlers::workers))
        .route("/api/events", get(handlers::events))
        .route("/api/state", get(handlers::state))
        .route("/api/sessions", get(handlers::sessions_list))
        .route("/api/sessions/:name/message", post(handlers::send_message))
        .route("/api/sessions/:name/stream", get(sse::stream_session))
        .route("/api/sessions/:name/approve-tool", post(handlers::approve_tool))
        .route("/api/sessions/:name/diff", get(handlers::diff))
        .route("/api/auth/setup", get(handlers::auth_setup))
        .route("/api/auth/validate", post(handlers::auth_validate))
        .route("/api/config", get(handlers::get_config).patch(handlers::patch_config))
        .route("/ws/sessions", get(ws::ws_upgrade))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_auth))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(ctx)
}

/// Every endpoint except the auth bootstrap pair requires a bearer token,
/// via the `Authorization` header or `?token=` for transports that can't
/// set headers (SSE, the CLI WS upgrade).
async fn require_auth(State(ctx): State<Arc<MasterContext>>, req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }
    let path = req.uri().path();
    if path == "/api/auth/setup" || path == "/api/auth/validate" {
        return next.run(req).await;
    }

    match extract_token(&req) {
        Some(token) if ctx.tokens.validate(&token) => next.run(req).await,
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing or invalid bearer token" }))).into_response(),
    }
}

fn extract_token(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    req.uri()
        .query()
        .and_then(|q| url_query_param(q, "token"))
}

fn url_query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next()?;
        if k == key {
            Some(v.to_string())
        } else {
            None
        }
    })
}
