//! HTTP surface tests, driven through the router with real worker
//! processes underneath. Skipped with a notice when python3 is missing.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use pylon_protocol::PylonConfig;
use pylon_server::{build_router, AppState};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const API_KEY: &str = "test-api-key";
const ADMIN_KEY: &str = "test-admin-key";

fn python_available() -> bool {
    std::env::var("PYTHON_PATH").is_ok() || which::which("python3").is_ok()
}

fn test_config(dir: &TempDir) -> PylonConfig {
    let mut config = PylonConfig {
        pool_size: 1,
        pool_min: 1,
        pool_max: 2,
        request_timeout: Duration::from_secs(15),
        borrow_timeout: Duration::from_secs(5),
        cpu_seconds: 5,
        code_bytes: 4096,
        api_keys: vec![API_KEY.to_string()],
        admin_key: Some(ADMIN_KEY.to_string()),
        sign_key: Some("test-sign-key".to_string()),
        store_root: dir.path().join("scripts"),
        audit_path: dir.path().join("audit.jsonl"),
        ..PylonConfig::default()
    };
    config.validate().expect("test config is valid");
    config
}

async fn test_app() -> Option<(TempDir, AppState, Router)> {
    if !python_available() {
        eprintln!("skipping: no python3 found (set PYTHON_PATH to override)");
        return None;
    }
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::initialize(test_config(&dir), None)
        .await
        .expect("state boots");
    let router = build_router(state.clone());
    Some((dir, state, router))
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", API_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_authed(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_is_public_and_headers_applied() {
    let Some((_dir, state, router)) = test_app().await else { return };

    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["referrer-policy"], "no-referrer");
    assert!(headers.contains_key("content-security-policy"));
    assert!(headers.contains_key("strict-transport-security"));
    assert!(headers.contains_key("permissions-policy"));

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_unauthenticated_request_refused() {
    let Some((_dir, state, router)) = test_app().await else { return };

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/eval")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"expression": "1"}).to_string()))
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_eval_happy_path_and_pool_stats() {
    let Some((_dir, state, router)) = test_app().await else { return };

    let (status, body) = send(&router, post_json("/api/v1/eval", json!({"expression": "2**100"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["result"].to_string(), "1267650600228229401496703205376");
    assert_eq!(body["stdout"], json!(""));

    // The executor is back after the request.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (status, stats) = send(&router, get_authed("/api/v1/pool-stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], json!(1));
    assert_eq!(stats["available"], json!(1));
    assert_eq!(stats["in_use"], json!(0));
    assert_eq!(stats["healthy"], json!(1));

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_restricted_sandbox_violation_and_admin_override() {
    let Some((_dir, state, router)) = test_app().await else { return };

    let body = json!({"code": "import os\nresult = os.getcwd()"});
    let (status, response) = send(&router, post_json("/api/v1/exec", body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["kind"], "sandbox_violation");
    assert!(response["message"].as_str().unwrap().contains("os"));

    // Same request with the admin key succeeds and returns a path.
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/exec")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", API_KEY)
        .header("x-admin-key", ADMIN_KEY)
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, response) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!response["result"].as_str().unwrap().is_empty());

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_unknown_field_rejected() {
    let Some((_dir, state, router)) = test_app().await else { return };

    let (status, body) = send(
        &router,
        post_json("/api/v1/eval", json!({"expression": "1", "bogus": true})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_code_size_boundary() {
    let Some((_dir, state, router)) = test_app().await else { return };
    // test config cap: 4096 bytes

    let exact = format!("result = 1 # {}", "a".repeat(4096 - 13));
    assert_eq!(exact.len(), 4096);
    let (status, _) = send(&router, post_json("/api/v1/exec", json!({"code": exact}))).await;
    assert_eq!(status, StatusCode::OK);

    let over = format!("result = 1 # {}", "a".repeat(4096 - 12));
    assert_eq!(over.len(), 4097);
    let (status, body) = send(&router, post_json("/api/v1/exec", json!({"code": over}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_check_syntax_no_pool() {
    let Some((_dir, state, router)) = test_app().await else { return };

    let (status, body) = send(
        &router,
        post_json("/api/v1/check-syntax", json!({"code": "x = 1\ny = x + 2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], json!(true));

    let (status, body) = send(
        &router,
        post_json("/api/v1/check-syntax", json!({"code": "def broken(:\n    pass"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], json!(false));
    assert!(body["line"].is_number());

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_call_module() {
    let Some((_dir, state, router)) = test_app().await else { return };

    let (status, body) = send(
        &router,
        post_json(
            "/api/v1/call-module",
            json!({"module": "math", "function": "sqrt", "args": [81]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!(9.0));

    // Blocked module is refused before any dispatch.
    let (status, body) = send(
        &router,
        post_json(
            "/api/v1/call-module",
            json!({"module": "os", "function": "getcwd"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "sandbox_violation");

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_scripts_crud_and_call_script() {
    let Some((_dir, state, router)) = test_app().await else { return };

    // Save
    let (status, saved) = send(
        &router,
        post_json(
            "/api/v1/scripts",
            json!({
                "name": "greeter",
                "folder": "demos",
                "code": "def main(who, punct='!'):\n    return 'hi ' + who + punct",
                "description": "test script"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["name"], json!("greeter"));
    assert_eq!(saved["legacy"], json!(false));

    // List
    let (status, listing) = send(&router, get_authed("/api/v1/scripts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["scripts"].as_array().unwrap().len(), 1);
    assert_eq!(listing["folders"], json!(["demos"]));

    // Call
    let (status, result) = send(
        &router,
        post_json(
            "/api/v1/call-script",
            json!({"name": "greeter", "args": ["there"], "kwargs": {"punct": "?"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["result"], json!("hi there?"));

    // Rename, move, get, delete
    let (status, renamed) = send(
        &router,
        post_json("/api/v1/scripts/greeter/rename", json!({"new_name": "welcomer"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["name"], json!("welcomer"));

    let (status, moved) = send(
        &router,
        post_json("/api/v1/scripts/welcomer/move", json!({"folder": "archive"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved["folder"], json!("archive"));

    let (status, fetched) = send(&router, get_authed("/api/v1/scripts/welcomer")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(fetched["code"].as_str().unwrap().contains("def main"));

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/v1/scripts/welcomer")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&router, get_authed("/api/v1/scripts/welcomer")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_tampered_script_yields_signature_invalid() {
    let Some((dir, state, router)) = test_app().await else { return };

    let (status, _) = send(
        &router,
        post_json(
            "/api/v1/scripts",
            json!({"name": "hello", "folder": "", "code": "result = 'hi'"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Corrupt the stored code out-of-band.
    let record_path = dir.path().join("scripts").join("hello.json");
    let content = std::fs::read_to_string(&record_path).unwrap();
    std::fs::write(&record_path, content.replace("'hi'", "'ho'")).unwrap();

    let (status, body) = send(
        &router,
        post_json("/api/v1/call-script", json!({"name": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "signature_invalid");
    // The response must not contain the stored code.
    assert!(!body.to_string().contains("'ho'"));

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    if !python_available() {
        eprintln!("skipping: no python3 found (set PYTHON_PATH to override)");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.rate_per_minute = 2;
    let state = AppState::initialize(config, None).await.unwrap();
    let router = build_router(state.clone());

    for _ in 0..2 {
        let (status, _) = send(&router, post_json("/api/v1/eval", json!({"expression": "1"}))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = send(&router, post_json("/api/v1/eval", json!({"expression": "1"}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["kind"], "rate_limited");

    // Rejected requests are still audit logged.
    let audit = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    assert!(audit.contains("rate_limited"));

    state.supervisor().shutdown().await;
}

#[tokio::test]
async fn test_metrics_track_executions() {
    let Some((_dir, state, router)) = test_app().await else { return };

    let (status, _) = send(&router, post_json("/api/v1/eval", json!({"expression": "1+1"}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &router,
        post_json("/api/v1/exec", json!({"code": "result = unknown_name"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, metrics) = send(&router, get_authed("/api/v1/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["total_executions"], json!(2));
    assert_eq!(metrics["successes"], json!(1));
    assert_eq!(metrics["failures"], json!(1));
    assert_eq!(metrics["failures_by_kind"]["name_error"], json!(1));

    let (status, history) = send(&router, get_authed("/api/v1/metrics/historical")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(history["snapshots"].is_array());

    let (status, alerts) = send(&router, get_authed("/api/v1/metrics/alerts")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(alerts["alerts"].is_array());

    state.supervisor().shutdown().await;
}
