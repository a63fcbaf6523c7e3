//! Ingress proxy: `/preview/{sessionId|shortId}/...` → the session's service.
//!
//! Liveness is checked once at entry; a teardown racing a proxied call shows
//! up as an upstream connection error. Bodies are fully buffered in both
//! directions, and a client body is forwarded whole or not at all.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::AppError;
use crate::gateway::probe_port;
use crate::provisioner::Provisioner;
use crate::registry::Session;

const UPSTREAM_ADDR: &str = "127.0.0.1";

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
pub struct IngressProxy {
    provisioner: Provisioner,
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl IngressProxy {
    pub fn new(provisioner: Provisioner, config: &ProxyConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| AppError::Internal(format!("proxy client: {e}")))?;
        Ok(Self {
            provisioner,
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Session addressed by a canonical id or, failing that, a short id.
    pub async fn resolve(&self, key: &str) -> Option<Session> {
        self.provisioner.registry().resolve(key).await
    }

    /// Forward `request` for the session addressed by `key`.
    pub async fn handle(&self, key: &str, request: Request) -> Response {
        let wants_html = accepts_html(request.headers());
        let Some(session) = self.resolve(key).await else {
            debug!(key, "preview for unknown session");
            return not_found(key, wants_html);
        };
        self.provisioner.registry().touch(&session.id).await;

        let port = match session.exposed_port {
            Some(port) => port,
            None => match probe_port(&self.provisioner, &session.id).await {
                Ok(Some(port)) => port,
                Ok(None) => return not_ready(&session.id, wants_html),
                Err(AppError::NotFound(_)) => return not_found(key, wants_html),
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "port probe failed");
                    return not_ready(&session.id, wants_html);
                }
            },
        };

        let (parts, body) = request.into_parts();
        let body = if parts.method == Method::GET || parts.method == Method::HEAD {
            None
        } else {
            match self.read_body(&parts.headers, body).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    debug!(session_id = %session.id, error = %err, "client body rejected");
                    return err.into_response();
                }
            }
        };

        match self.forward(port, parts, body).await {
            Ok(response) => response,
            Err(err) if err.is_connect() => {
                debug!(session_id = %session.id, port, error = %err, "upstream not accepting yet");
                not_ready(&session.id, wants_html)
            }
            Err(err) if err.is_timeout() => {
                warn!(session_id = %session.id, port, error = %err, "upstream did not answer in time");
                AppError::UpstreamTimeout(format!("session {} on port {port}", session.id))
                    .into_response()
            }
            Err(err) => {
                warn!(session_id = %session.id, port, error = %err, "upstream request failed");
                AppError::BadGateway(err.to_string()).into_response()
            }
        }
    }

    /// Buffer the client body, refusing anything over the limit.
    async fn read_body(&self, headers: &HeaderMap, body: Body) -> Result<Bytes, AppError> {
        let limit = self.max_body_bytes;
        let too_large = || AppError::PayloadTooLarge(format!("request body exceeds {limit} bytes"));
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > limit as u64) {
            return Err(too_large());
        }
        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) if err.is::<LengthLimitError>() => Err(too_large()),
            Err(err) => Err(AppError::BadRequest(format!("request body could not be read: {err}"))),
        }
    }

    async fn forward(
        &self,
        port: u16,
        parts: axum::http::request::Parts,
        body: Option<Bytes>,
    ) -> Result<Response, reqwest::Error> {
        let url = upstream_url(port, parts.uri.path(), parts.uri.query());

        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(header::HOST);
        if let Ok(host) = HeaderValue::from_str(&format!("localhost:{port}")) {
            headers.insert(header::HOST, host);
        }

        let mut upstream = self.client.request(parts.method, url).headers(headers);
        if let Some(bytes) = body {
            upstream = upstream.body(bytes);
        }

        let reply = upstream.send().await?;
        let status = reply.status();
        let reply_headers = strip_hop_by_hop(reply.headers());
        let bytes = reply.bytes().await?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = reply_headers;
        Ok(response)
    }
}

/// Path below `/preview/{key}` taken from the raw (still percent-encoded) URI.
pub fn upstream_path(raw_path: &str) -> &str {
    let rest = raw_path.strip_prefix("/preview/").unwrap_or(raw_path);
    match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    }
}

pub fn upstream_url(port: u16, raw_path: &str, query: Option<&str>) -> String {
    let mut url = format!("http://{UPSTREAM_ADDR}:{port}{}", upstream_path(raw_path));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str()) || name.as_str().starts_with("proxy-")
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

fn not_found(key: &str, html: bool) -> Response {
    if html {
        let page = format!(
            "<!doctype html><html><head><title>Preview not found</title></head>\
             <body><h1>Preview not found</h1><p>No live session matches <code>{}</code>. \
             It may have expired.</p></body></html>",
            escape_html(key)
        );
        return (StatusCode::NOT_FOUND, Html(page)).into_response();
    }
    AppError::NotFound(format!("no live session for {key}")).into_response()
}

fn not_ready(session_id: &str, html: bool) -> Response {
    let mut response = if html {
        let page = "<!doctype html><html><head><title>Starting up</title>\
                    <meta http-equiv=\"refresh\" content=\"2\"></head>\
                    <body><h1>Starting up…</h1><p>The preview server is not accepting \
                    connections yet. This page reloads automatically.</p></body></html>";
        (StatusCode::SERVICE_UNAVAILABLE, Html(page)).into_response()
    } else {
        AppError::UpstreamNotReady(format!("session {session_id} is starting up")).into_response()
    };
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("2"));
    response
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
