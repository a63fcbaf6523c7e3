//! Fixed-window admission limiter for the exec entry point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LimiterConfig;
use crate::error::AppError;

/// Per-client counter for the current window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRecord {
    pub window_count: u32,
    pub window_reset_at: Instant,
}

#[derive(Clone)]
pub struct AdmissionLimiter {
    records: Arc<Mutex<HashMap<String, RateLimitRecord>>>,
    max_requests: u32,
    window: Duration,
}

impl AdmissionLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    pub fn from_config(config: &LimiterConfig) -> Self {
        Self::new(config.max_requests, Duration::from_secs(config.window_secs))
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, RateLimitRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one request from `client` at `now`. Returns the remaining budget
    /// or `RateLimited` with the seconds until the window resets.
    pub fn check_at(&self, client: &str, now: Instant) -> Result<u32, AppError> {
        let mut records = self.records();
        let record = records
            .entry(client.to_string())
            .or_insert(RateLimitRecord {
                window_count: 0,
                window_reset_at: now + self.window,
            });
        if now >= record.window_reset_at {
            record.window_count = 0;
            record.window_reset_at = now + self.window;
        }
        if record.window_count >= self.max_requests {
            let wait = record.window_reset_at.saturating_duration_since(now);
            let retry_after_secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            return Err(AppError::RateLimited {
                retry_after_secs: retry_after_secs.max(1),
            });
        }
        record.window_count += 1;
        Ok(self.max_requests - record.window_count)
    }

    pub fn check(&self, client: &str) -> Result<u32, AppError> {
        self.check_at(client, Instant::now())
    }

    /// Drop records whose window has rolled over.
    pub fn purge_stale_at(&self, now: Instant) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| record.window_reset_at > now);
        before - records.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.records().len()
    }

    pub fn spawn_purger(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let purged = limiter.purge_stale_at(Instant::now());
                if purged > 0 {
                    debug!(purged, "stale rate limit windows dropped");
                }
            }
        })
    }
}

/// Identify the caller: first `X-Forwarded-For` hop, else the peer address.
fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

/// Middleware guarding the exec route.
pub async fn admit(State(limiter): State<AdmissionLimiter>, request: Request, next: Next) -> Response {
    let client = client_key(&request);
    match limiter.check(&client) {
        Ok(_) => next.run(request).await,
        Err(err) => {
            warn!(client = %client, "exec request rate limited");
            err.into_response()
        }
    }
}
