//! Ingress proxy against a real upstream listening on an ephemeral port.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceExt;

use preview_sandbox::config::Config;
use preview_sandbox::http_server;
use preview_sandbox::registry::ProjectKind;

use super::test_helpers::app_state;

/// Start a small upstream server and return its port.
async fn spawn_upstream() -> u16 {
    let app = Router::new()
        .route("/", get(|| async { "hello from upstream" }))
        .route(
            "/whoami",
            get(|headers: HeaderMap| async move {
                headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        )
        .route(
            "/api/echo",
            post(|uri: axum::http::Uri, body: String| async move {
                format!("{}|{body}", uri.query().unwrap_or_default())
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "too late"
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn canonical_and_short_id_reach_the_same_upstream() {
    let h = app_state(Config::default());
    let port = spawn_upstream().await;
    let provisioned = h
        .state
        .provisioner
        .create(Some("preview-1234abcd"), ProjectKind::Node)
        .await
        .unwrap();
    h.state
        .registry()
        .set_exposed_port(&provisioned.session_id, port)
        .await;
    let app = http_server::router(h.state.clone());

    for key in ["preview-1234abcd", "1234abcd"] {
        let response = app
            .clone()
            .oneshot(get_request(&format!("/preview/{key}/")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello from upstream");
    }

    let response = app
        .oneshot(get_request("/preview/1234abcd/whoami"))
        .await
        .unwrap();
    assert_eq!(body_text(response).await, format!("localhost:{port}"));
}

#[tokio::test]
async fn request_body_and_query_are_forwarded() {
    let h = app_state(Config::default());
    let port = spawn_upstream().await;
    h.state
        .provisioner
        .create(Some("poster"), ProjectKind::Node)
        .await
        .unwrap();
    h.state.registry().set_exposed_port("poster", port).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/preview/poster/api/echo?x=1")
        .body(Body::from("payload"))
        .unwrap();
    let response = http_server::router(h.state.clone())
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "x=1|payload");
}

#[tokio::test]
async fn session_without_server_is_starting_up() {
    let h = app_state(Config::default());
    h.state
        .provisioner
        .create(Some("booting"), ProjectKind::Node)
        .await
        .unwrap();

    let response = http_server::router(h.state.clone())
        .oneshot(get_request("/preview/booting/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
}

#[tokio::test]
async fn closed_port_is_starting_up() {
    let h = app_state(Config::default());
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    h.state
        .provisioner
        .create(Some("refused"), ProjectKind::Node)
        .await
        .unwrap();
    h.state.registry().set_exposed_port("refused", closed).await;

    let response = http_server::router(h.state.clone())
        .oneshot(get_request("/preview/refused/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let h = app_state(Config::default());
    let app = http_server::router(h.state.clone());

    let response = app
        .clone()
        .oneshot(get_request("/preview/missing/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_text(response).await.contains("not_found"));

    let request = Request::builder()
        .uri("/preview/missing/")
        .header(header::ACCEPT, "text/html,application/xhtml+xml")
        .body(Body::empty())
        .unwrap();
    let response = app
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_text(response).await.contains("Preview not found"));
}

#[tokio::test]
async fn destroyed_session_is_no_longer_proxied() {
    let h = app_state(Config::default());
    let port = spawn_upstream().await;
    h.state
        .provisioner
        .create(Some("short-lived-abcdefgh"), ProjectKind::Node)
        .await
        .unwrap();
    h.state
        .registry()
        .set_exposed_port("short-lived-abcdefgh", port)
        .await;
    h.state.provisioner.destroy("short-lived-abcdefgh").await;

    let response = http_server::router(h.state.clone())
        .oneshot(get_request("/preview/abcdefgh/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_body_is_rejected_before_forwarding() {
    let mut config = Config::default();
    config.proxy.max_body_bytes = 1024;
    let h = app_state(config);

    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = Router::new().route(
        "/upload",
        post({
            let hits = hits.clone();
            move |body: axum::body::Bytes| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                body.len().to_string()
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });
    h.state
        .provisioner
        .create(Some("big"), ProjectKind::Node)
        .await
        .unwrap();
    h.state.registry().set_exposed_port("big", port).await;
    let app = http_server::router(h.state.clone());

    // Streamed without a declared length.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/preview/big/upload")
        .body(Body::from(vec![b'x'; 1025]))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body_text(response).await.contains("payload_too_large"));

    // Declared length over the limit.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/preview/big/upload")
        .header(header::CONTENT_LENGTH, "4096")
        .body(Body::from(vec![b'x'; 4096]))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Exactly at the limit goes through whole.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/preview/big/upload")
        .body(Body::from(vec![b'x'; 1024]))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "1024");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_upstream_is_a_gateway_timeout() {
    let mut config = Config::default();
    config.proxy.request_timeout_secs = 1;
    let h = app_state(config);
    let port = spawn_upstream().await;
    h.state
        .provisioner
        .create(Some("sluggish"), ProjectKind::Node)
        .await
        .unwrap();
    h.state.registry().set_exposed_port("sluggish", port).await;

    let response = http_server::router(h.state.clone())
        .oneshot(get_request("/preview/sluggish/slow"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(body_text(response).await.contains("upstream_timeout"));
}
