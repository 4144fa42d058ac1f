//! Integration tests for the master's HTTP API surface.
//! Spins up the real router on a random port and drives it with real HTTP requests.

use std::sync::Arc;

use csm::config::MasterConfig;
use csm::master::MasterContext;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Bind the real axum router behind a random port and return its base URL
/// plus the context, so tests can also assert against in-process state.
async fn spawn_master(dir: &TempDir) -> (String, Arc<MasterContext>) {
    let config = MasterConfig::new(Some(0), Some(dir.path().to_path_buf()), Some("error".to_string()));
    let ctx = MasterContext::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = csm::api::router(ctx.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), ctx)
}

#[tokio::test]
async fn health_endpoint_reports_zero_counts_on_a_fresh_master() {
    let dir = TempDir::new().unwrap();
    let (base, ctx) = spawn_master(&dir).await;
    // exercise the constructed context so a fresh master isn't an unused binding
    assert_eq!(ctx.aggregator.workers().await.len(), 0);

    let resp = reqwest::get(format!("{base}/api/health")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["workers"], 0);
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["events"], 0);
}

#[tokio::test]
async fn auth_setup_is_idempotent_and_unauthenticated_requests_are_rejected() {
    let dir = TempDir::new().unwrap();
    let (base, _ctx) = spawn_master(&dir).await;
    let client = reqwest::Client::new();

    let r1 = client.get(format!("{base}/api/auth/setup")).send().await.unwrap();
    let t1: serde_json::Value = r1.json().await.unwrap();
    let r2 = client.get(format!("{base}/api/auth/setup")).send().await.unwrap();
    let t2: serde_json::Value = r2.json().await.unwrap();
    assert_eq!(t1["token"], t2["token"], "auth/setup must return the same token on every call");

    // No bearer token at all — every other endpoint must reject.
    let resp = client.get(format!("{base}/api/workers")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    // Wrong token — still rejected.
    let resp = client
        .get(format!("{base}/api/workers"))
        .bearer_auth("not-the-real-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Correct token — accepted.
    let token = t1["token"].as_str().unwrap();
    let resp = client
        .get(format!("{base}/api/workers"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["workers"].is_array());
}

#[tokio::test]
async fn auth_validate_distinguishes_valid_from_invalid_tokens() {
    let dir = TempDir::new().unwrap();
    let (base, _ctx) = spawn_master(&dir).await;
    let client = reqwest::Client::new();

    let setup: serde_json::Value = client
        .get(format!("{base}/api/auth/setup"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = setup["token"].as_str().unwrap().to_string();

    let valid: serde_json::Value = client
        .post(format!("{base}/api/auth/validate"))
        .json(&serde_json::json!({ "token": token }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(valid["valid"], true);

    let invalid: serde_json::Value = client
        .post(format!("{base}/api/auth/validate"))
        .json(&serde_json::json!({ "token": "garbage" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(invalid["valid"], false);
}

#[tokio::test]
async fn worker_events_ingested_via_http_surface_in_workers_and_health() {
    let dir = TempDir::new().unwrap();
    let (base, _ctx) = spawn_master(&dir).await;
    let client = reqwest::Client::new();

    let setup: serde_json::Value = client
        .get(format!("{base}/api/auth/setup"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = setup["token"].as_str().unwrap().to_string();

    let event = serde_json::json!({
        "type": "worker_registered",
        "workerId": "test-worker-1",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": { "sessionCount": 0, "hostInfo": { "hostname": "test-host" } },
    });
    let resp = client
        .post(format!("{base}/api/worker-events"))
        .bearer_auth(&token)
        .json(&event)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let health: serde_json::Value = client
        .get(format!("{base}/api/health"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["workers"], 1);

    let workers: serde_json::Value = client
        .get(format!("{base}/api/workers"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let list = workers["workers"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], "test-worker-1");

    // The response must never leak the auth token or the on-disk data directory.
    assert!(health.get("auth_token").is_none());
    assert!(health.get("data_dir").is_none());
}
