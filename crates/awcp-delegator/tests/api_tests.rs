// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP surface tests for the delegator daemon.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use awcp_config::{AdmissionLimits, DelegatorConfig};
use awcp_delegator::service::DelegatorService;
use awcp_delegator::{AppState, build_app};
use awcp_transport::DelegatorTransportRegistry;
use awcp_transport::archive::ArchiveDelegatorTransport;

fn test_state(base_dir: &std::path::Path) -> AppState {
    let config = DelegatorConfig {
        base_dir: base_dir.to_path_buf(),
        admission: AdmissionLimits {
            max_total_bytes: 1024 * 1024,
            ..AdmissionLimits::default()
        },
        ..DelegatorConfig::default()
    };
    let mut transports = DelegatorTransportRegistry::new();
    transports.register(Arc::new(ArchiveDelegatorTransport::default()));
    AppState {
        service: DelegatorService::new(config, transports).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn delegate_body(executor_url: &str, source: &std::path::Path) -> String {
    serde_json::json!({
        "executorUrl": executor_url,
        "environment": {
            "resources": [{ "name": "ws", "type": "directory", "source": source, "mode": "rw" }]
        },
        "task": { "description": "touch", "prompt": "do the thing" }
    })
    .to_string()
}

fn post(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["protocolVersion"], awcp_core::PROTOCOL_VERSION);
}

#[tokio::test]
async fn delegations_starts_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/delegations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["activeDelegations"], 0);
    assert!(json["delegations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn delegate_missing_source_is_workspace_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let resp = app
        .oneshot(post(
            "/delegate",
            delegate_body(
                "http://127.0.0.1:1",
                std::path::Path::new("/definitely/not/here"),
            ),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["code"], "WORKSPACE_NOT_FOUND");
    assert!(json["hint"].is_string());
}

#[tokio::test]
async fn delegate_file_source_is_workspace_invalid() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("plain.txt");
    std::fs::write(&file, "not a directory").unwrap();
    let app = build_app(test_state(tmp.path()));

    let resp = app
        .oneshot(post("/delegate", delegate_body("http://127.0.0.1:1", &file)))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["code"], "WORKSPACE_INVALID");
}

#[tokio::test]
async fn delegate_oversized_workspace_rejected_with_hint() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path().join("big");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("blob.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();
    let state = test_state(tmp.path());
    let app = build_app(state);

    let resp = app
        .oneshot(post("/delegate", delegate_body("http://127.0.0.1:1", &ws)))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["code"], "WORKSPACE_TOO_LARGE");
    assert!(json["hint"].as_str().unwrap().contains("MB"));

    // Admission failures happen before anything is materialized.
    assert!(!tmp.path().join("environments").exists());
}

#[tokio::test]
async fn delegate_sensitive_files_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join(".env"), "SECRET=1").unwrap();
    let app = build_app(test_state(tmp.path()));

    let resp = app
        .oneshot(post("/delegate", delegate_body("http://127.0.0.1:1", &ws)))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = body_json(resp).await;
    assert_eq!(json["code"], "SENSITIVE_FILES");
    assert!(json["error"].as_str().unwrap().contains(".env"));
}

#[tokio::test]
async fn delegate_to_unreachable_executor_is_bad_gateway() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("a.txt"), "hi").unwrap();
    let app = build_app(test_state(tmp.path()));

    // Port 1 refuses connections; the INVITE fails before ACCEPT.
    let resp = app
        .oneshot(post("/delegate", delegate_body("http://127.0.0.1:1", &ws)))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(resp).await["code"], "TRANSPORT_ERROR");
}

#[tokio::test]
async fn unknown_delegation_is_404_with_hint() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let resp = app
        .oneshot(
            Request::builder()
                .uri(format!("/delegation/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let json = body_json(resp).await;
    assert_eq!(json["code"], "NOT_FOUND");
    assert!(json["hint"].is_string());
}

#[tokio::test]
async fn cancel_unknown_delegation_is_404() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));

    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/delegation/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn snapshot_ops_on_unknown_delegation_are_404() {
    let tmp = tempfile::tempdir().unwrap();
    let app = build_app(test_state(tmp.path()));
    let id = Uuid::new_v4();

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/delegation/{id}/snapshots"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .oneshot(post(
            &format!("/delegation/{id}/snapshots/snap_1/apply"),
            String::new(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_delegation_record_remains_visible() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();
    std::fs::write(ws.join("a.txt"), "hi").unwrap();
    let state = test_state(tmp.path());
    let app = build_app(state.clone());

    let resp = app
        .oneshot(post("/delegate", delegate_body("http://127.0.0.1:1", &ws)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

    // The refused delegation is retained as an error record.
    let records = state.service.list().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].is_terminal());
    assert_eq!(
        records[0].error.as_ref().unwrap().code,
        awcp_core::error::ErrorCode::TransportError
    );
}
