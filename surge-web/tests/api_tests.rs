//! Router tests driving the API through `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use serde_json::Value;
use surge_core::config::SurgeConfig;
use surge_core::engine::spawn_speed_test_engine;
use surge_web::{AppState, build_router};
use tower::ServiceExt;

fn test_app() -> Router {
    let config = SurgeConfig::for_testing();
    let transport = Arc::new(config.simulation.transport());
    let engine = spawn_speed_test_engine(config, transport);
    build_router(AppState { engine })
}

async fn send(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_status_of_fresh_engine() {
    let app = test_app();

    let (status, json) = send_json(&app, Method::GET, "/api/status", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], -1);
    assert_eq!(json["status_name"], "idle");
    assert_eq!(json["download"], "");
    assert_eq!(json["test_id"], "noID");
}

#[tokio::test(start_paused = true)]
async fn test_start_then_abort() {
    let app = test_app();

    let (status, json) =
        send_json(&app, Method::POST, "/api/start", r#"{"test_order": "D"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "started");
    let session_id = json["session_id"].clone();

    let (_, json) = send_json(&app, Method::POST, "/api/start", "").await;
    assert_eq!(json["outcome"], "already_running");
    assert_eq!(json["session_id"], session_id);

    tokio::time::sleep(Duration::from_millis(800)).await;
    let (_, json) = send_json(&app, Method::GET, "/api/status", "").await;
    assert_eq!(json["status_name"], "download");

    let (status, json) = send_json(&app, Method::POST, "/api/abort", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["aborted"], true);

    let (_, json) = send_json(&app, Method::GET, "/api/status", "").await;
    assert_eq!(json["status"], 5);
    assert_eq!(json["download"], "");

    let (status, bytes) = send(&app, Method::GET, "/api/log", "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(bytes).unwrap().contains("manually aborted"));
}

#[tokio::test(start_paused = true)]
async fn test_text_commands() {
    let app = test_app();

    let (status, json) = send_json(&app, Method::POST, "/api/command", "status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status_name"], "idle");

    let (_, json) = send_json(&app, Method::POST, "/api/command", "abort").await;
    assert_eq!(json["aborted"], false);

    let (status, json) = send_json(
        &app,
        Method::POST,
        "/api/command",
        r#"start {"test_order": "P", "count_ping": 3}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "started");

    tokio::time::sleep(Duration::from_secs(1)).await;
    let (_, json) = send_json(&app, Method::POST, "/api/command", "status").await;
    assert_eq!(json["status_name"], "finished");
    assert_eq!(json["ping"], "10.00");
    assert_eq!(json["jitter"], "0.00");
}

#[tokio::test]
async fn test_unknown_command_is_rejected() {
    let app = test_app();

    let (status, json) = send_json(&app, Method::POST, "/api/command", "reboot").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Invalid command: Unknown command: reboot");
}

#[tokio::test]
async fn test_garbage_streams_requested_size() {
    let app = test_app();

    let request = Request::builder()
        .uri("/garbage?ckSize=2")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "2097152");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 2 * 1024 * 1024);
}

#[tokio::test]
async fn test_garbage_size_is_clamped() {
    let app = test_app();

    let (status, bytes) = send(&app, Method::GET, "/garbage?ckSize=0", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes.len(), 1024 * 1024);
}

#[tokio::test]
async fn test_empty_accepts_uploads() {
    let app = test_app();

    let (status, bytes) = send(&app, Method::GET, "/empty", "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(bytes.is_empty());

    let upload = "x".repeat(3 * 1024 * 1024);
    let (status, bytes) = send(&app, Method::POST, "/empty", &upload).await;
    assert_eq!(status, StatusCode::OK);
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_get_ip_prefers_forwarded_header() {
    let app = test_app();

    let request = Request::builder()
        .uri("/getIP")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["processedString"], "203.0.113.7");
    assert_eq!(json["rawIspInfo"], "");
}

#[tokio::test]
async fn test_get_ip_without_address_fails() {
    let app = test_app();

    let (status, _) = send(&app, Method::GET, "/getIP", "").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
