//! HTTP surface: session endpoints, file sync, exec and its admission limit.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use preview_sandbox::config::Config;
use preview_sandbox::http_server;

use super::test_helpers::app_state;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.7");
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let h = app_state(Config::default());
    let app = http_server::router(h.state.clone());

    let (status, created) = call(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({ "sessionId": "http-session", "projectKind": "node" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["sessionId"], "http-session");
    assert_eq!(created["existing"], false);

    let (status, again) = call(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({ "sessionId": "http-session" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["existing"], true);
    assert_eq!(again["environmentId"], created["environmentId"]);

    let (status, info) = call(&app, Method::GET, "/sessions/http-session", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["status"], "running");
    assert_eq!(info["extended"], false);

    let (_, listed) = call(&app, Method::GET, "/sessions", None).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (_, first) = call(&app, Method::PATCH, "/sessions/http-session/extend", None).await;
    let (_, second) = call(&app, Method::PATCH, "/sessions/http-session/extend", None).await;
    assert_eq!(first["extended"], true);
    assert_eq!(second["extended"], false);

    let (status, _) = call(&app, Method::DELETE, "/sessions/http-session", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::DELETE, "/sessions/http-session", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, error) = call(&app, Method::GET, "/sessions/http-session", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"], "not_found");
}

#[tokio::test]
async fn create_without_body_mints_an_id() {
    let h = app_state(Config::default());
    let app = http_server::router(h.state.clone());
    let (status, created) = call(&app, Method::POST, "/sessions", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["sessionId"].as_str().unwrap();
    assert!(id.ends_with(created["shortId"].as_str().unwrap()));
}

#[tokio::test]
async fn files_and_exec_over_http() {
    let h = app_state(Config::default());
    h.fake.set_unreachable(true);
    let app = http_server::router(h.state.clone());

    let (_, created) = call(
        &app,
        Method::POST,
        "/sessions",
        Some(json!({ "sessionId": "workbench" })),
    )
    .await;
    assert_eq!(created["simulated"], true);

    let files = json!({ "files": [
        { "name": "src", "kind": "folder", "children": [
            { "name": "main.sh", "kind": "file", "content": "echo built" }
        ]}
    ]});
    let (status, synced) = call(&app, Method::POST, "/sessions/workbench/files", Some(files)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(synced["files"], 1);

    let (_, tree) = call(&app, Method::GET, "/sessions/workbench/files", None).await;
    assert_eq!(tree["files"][0]["name"], "src");
    assert_eq!(tree["files"][0]["children"][0]["content"], "echo built");

    let (status, result) = call(
        &app,
        Method::POST,
        "/sessions/workbench/exec",
        Some(json!({ "command": "sh src/main.sh" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["exitCode"], 0);
    assert_eq!(result["stdout"], "built\n");
}

#[tokio::test]
async fn exec_is_rate_limited_per_client() {
    let mut config = Config::default();
    config.limiter.max_requests = 2;
    let h = app_state(config);
    let app = http_server::router(h.state.clone());

    let command = json!({ "command": "true" });
    for _ in 0..2 {
        let (status, _) = call(&app, Method::POST, "/sessions/nobody/exec", Some(command.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    let request = Request::builder()
        .method(Method::POST)
        .uri("/sessions/nobody/exec")
        .header("x-forwarded-for", "203.0.113.7")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(command.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    // Other endpoints and other clients are unaffected.
    let (status, _) = call(&app, Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/sessions/nobody/exec")
        .header("x-forwarded-for", "198.51.100.1")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(command.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_check() {
    let h = app_state(Config::default());
    let response = http_server::router(h.state.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
