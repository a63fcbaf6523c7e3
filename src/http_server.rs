//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{AppError, Result};
use crate::gateway::{ExecOptions, ExecResult};
use crate::lifetime::spawn_sweeper;
use crate::limiter;
use crate::registry::{EnvironmentId, ProjectKind, Session, SessionStatus};
use crate::state::AppState;
use crate::workspace::{self, FileNode};

// Request/Response types
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    project_kind: ProjectKind,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    exists: bool,
    id: String,
    short_id: String,
    status: SessionStatus,
    environment_id: EnvironmentId,
    simulated: bool,
    project_kind: ProjectKind,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    extended: bool,
    deadline: DateTime<Utc>,
    exposed_port: Option<u16>,
}

impl SessionInfo {
    fn new(session: Session, state: &AppState) -> Self {
        let deadline = session.deadline(state.provisioner.policy());
        Self {
            exists: true,
            simulated: session.environment_id.is_simulated(),
            id: session.id,
            short_id: session.short_id,
            status: session.status,
            environment_id: session.environment_id,
            project_kind: session.project_kind,
            created_at: session.created_at,
            last_accessed_at: session.last_accessed_at,
            extended: session.extended,
            deadline,
            exposed_port: session.exposed_port,
        }
    }
}

#[derive(Deserialize)]
struct SyncRequest {
    files: Vec<FileNode>,
}

#[derive(Serialize)]
struct FilesResponse {
    files: Vec<FileNode>,
}

#[derive(Deserialize)]
struct ExecRequest {
    command: String,
    #[serde(default)]
    background: bool,
}

/// Build the router. The admission limiter guards only the exec route.
pub fn router(state: AppState) -> Router {
    let exec_routes = Router::new()
        .route("/sessions/:id/exec", post(exec))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            limiter::admit,
        ));

    Router::new()
        // Session management
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/extend", patch(extend_session))
        // Workspace
        .route("/sessions/:id/files", post(sync_files).get(read_files))
        .merge(exec_routes)
        // Ingress
        .route("/preview/*rest", any(preview))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server plus the background loops until `cancel` fires.
pub async fn run_server(port: u16, state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
    let sweeper = spawn_sweeper(
        state.provisioner.clone(),
        state.config.lifetime.sweep_interval(),
        cancel.clone(),
    );
    let purger = state.limiter.spawn_purger(
        std::time::Duration::from_secs(state.config.limiter.purge_interval_secs.max(1)),
        cancel.clone(),
    );

    let app = router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.clone().cancelled_owned())
    .await?;

    cancel.cancel();
    let _ = tokio::join!(sweeper, purger);
    let destroyed = state.provisioner.destroy_all().await;
    info!(destroyed, "HTTP server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Response> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let provisioned = state
        .provisioner
        .create(req.session_id.as_deref(), req.project_kind)
        .await?;
    let status = if provisioned.existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(provisioned)).into_response())
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let mut sessions = state.registry().list().await;
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(
        sessions
            .into_iter()
            .map(|session| SessionInfo::new(session, &state))
            .collect(),
    )
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>> {
    let session = state
        .registry()
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
    Ok(Json(SessionInfo::new(session, &state)))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    state.provisioner.destroy(&id).await;
    Json(json!({ "ok": true }))
}

async fn extend_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let extended = state.provisioner.extend_lifetime(&id).await;
    Json(json!({ "extended": extended }))
}

async fn sync_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<serde_json::Value>> {
    let files = workspace::write_tree(&state.provisioner, &id, &req.files).await?;
    Ok(Json(json!({ "ok": true, "files": files })))
}

async fn read_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FilesResponse>> {
    let files = workspace::read_tree(&state.provisioner, &id).await?;
    Ok(Json(FilesResponse { files }))
}

async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecResult>> {
    info!(session_id = %id, background = req.background, "POST exec");
    let result = state
        .gateway
        .exec(
            &id,
            &req.command,
            ExecOptions {
                background: req.background,
            },
        )
        .await?;
    Ok(Json(result))
}

async fn preview(State(state): State<AppState>, request: Request) -> Response {
    let key = preview_key(request.uri().path()).unwrap_or_default().to_string();
    state.proxy.handle(&key, request).await
}

/// First path segment after `/preview/`.
fn preview_key(raw_path: &str) -> Option<&str> {
    raw_path
        .strip_prefix("/preview/")?
        .split('/')
        .next()
        .filter(|key| !key.is_empty())
}
