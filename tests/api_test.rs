mod common;

use audit_chain::api;
use audit_chain::audit::{AuditChain, AuditDraft, Level};
use audit_chain::storage::MemoryStorage;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn seeded_chain() -> Arc<AuditChain> {
    let chain = setup_memory_chain().await;
    chain
        .record(
            AuditDraft::new("auth_failure", Level::Warn, "bad password")
                .user_id("mallory")
                .correlation_id("req-1"),
        )
        .await
        .unwrap();
    chain
        .record(AuditDraft::new("code_executed", Level::Info, "sandbox run finished").task_id("t-1"))
        .await
        .unwrap();
    chain
        .record(AuditDraft::new("rbac_denied", Level::Error, "missing role").user_id("mallory"))
        .await
        .unwrap();
    chain
}

#[tokio::test]
async fn test_health() {
    let app = api::router(setup_memory_chain().await);
    let (status, body) = send(app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_query_shape_and_filters() {
    let app = api::router(seeded_chain().await);

    let (status, body) = send(app.clone(), get("/audit")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["limit"], 100);
    assert_eq!(body["offset"], 0);
    assert_eq!(body["entries"][0]["event"], "rbac_denied");
    assert!(body["entries"][0]["integrity"]["previousEntryHash"].is_string());

    let (_, body) = send(
        app.clone(),
        get("/audit?level=warn,error&userId=mallory&order=asc&limit=1"),
    )
    .await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    assert_eq!(body["entries"][0]["event"], "auth_failure");

    let (_, body) = send(app.clone(), get("/audit?taskId=t-1")).await;
    assert_eq!(body["total"], 1);

    let (status, body) = send(app, get("/audit?level=critical")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_search_and_lookup() {
    let chain = seeded_chain().await;
    let app = api::router(chain.clone());

    let (status, body) = send(app.clone(), get("/audit/search?q=sandbox")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    let id = body["entries"][0]["id"].as_str().unwrap().to_string();

    let (status, body) = send(app.clone(), get(&format!("/audit/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["taskId"], "t-1");

    let (status, _) = send(app.clone(), get("/audit/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(app, get("/audit/search")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_verify_and_stats() {
    let app = api::router(seeded_chain().await);

    let (status, body) = send(app.clone(), get("/audit/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entriesCount"], 3);
    assert_eq!(body["signingKeyVersion"], 1);
    assert!(body["chainValid"].is_null());

    let (status, body) = send(
        app.clone(),
        Request::builder()
            .method("POST")
            .uri("/audit/verify")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"valid": true, "entriesChecked": 3}));

    let (_, body) = send(app.clone(), post_json("/audit/verify", json!({"from": 2, "to": 3}))).await;
    assert_eq!(body["entriesChecked"], 2);

    let (_, body) = send(app, get("/audit/stats")).await;
    assert_eq!(body["chainValid"], true);
}

#[tokio::test]
async fn test_malformed_verify_range_is_rejected() {
    let app = api::router(seeded_chain().await);

    let (status, body) = send(app.clone(), post_json("/audit/verify", json!({"from": "abc"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid verify request"));

    let (status, _) = send(
        app.clone(),
        Request::builder()
            .method("POST")
            .uri("/audit/verify")
            .header("content-type", "application/json")
            .body(Body::from("{\"from\": 1,"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Rejected requests never run, so nothing is cached.
    let (_, body) = send(app, get("/audit/stats")).await;
    assert!(body["lastVerification"].is_null());
}

#[tokio::test]
async fn test_verify_before_initialize_is_conflict() {
    let chain = Arc::new(AuditChain::new(Arc::new(MemoryStorage::new()), test_keys()));
    let app = api::router(chain);

    let (status, body) = send(app, post_json("/audit/verify", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("not initialized"));
}
