//! HTTP routes and the `/ws` upgrade endpoint (§6).
//!
//! Grounded on the teacher's accept-loop style in `socket/server.rs`:
//! build one `Router`, bind once, `axum::serve` with graceful shutdown.
//! Route handlers stay thin — project/conversation/job logic lives in their
//! owning modules; a handler only validates the request shape and maps the
//! result onto a status code.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::crypto;
use crate::error::AppError;
use crate::notifications::push::PushSubscription;
use crate::state::AppState;
use crate::ws;

/// Build the full router: pairing, project/git/conversation/worktree APIs,
/// push registration, the `/ws` upgrade, and an ambient `/healthz` probe.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/pair/{token}", get(pair_get).post(pair_post))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/{id}/git", get(project_git))
        .route("/api/projects/{id}/conversation", get(project_conversation))
        .route("/api/projects/{id}/pr", get(project_pr))
        .route("/api/projects/{id}/worktrees", get(list_worktrees).post(create_worktree).delete(remove_worktree))
        .route("/api/push/vapid", get(vapid_public_key))
        .route("/api/push/subscribe", post(push_subscribe))
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_upgrade(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_connection(socket, state))
}

fn wants_html(headers: &HeaderMap) -> bool {
    headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()).is_some_and(|v| v.contains("text/html"))
}

#[derive(Debug, Serialize)]
struct ServerPublicKeyResponse {
    #[serde(rename = "serverPublicKey")]
    server_public_key: String,
}

#[derive(Debug, Serialize)]
struct PairResponse {
    #[serde(rename = "serverPublicKey")]
    server_public_key: String,
    #[serde(rename = "deviceId")]
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct PairRequest {
    #[serde(rename = "clientPublicKey")]
    client_public_key: String,
}

/// `GET /pair/{token}` (§4.2). HTML clients are redirected to the chat page
/// carrying the token; API clients get the server's public key, guarded by
/// the single-pairing-at-a-time policy documented in DESIGN.md.
async fn pair_get(State(state): State<Arc<AppState>>, Path(token): Path<String>, headers: HeaderMap) -> Response {
    if wants_html(&headers) {
        return Redirect::to(&format!("{}/?pairingToken={token}", state.config.public_url)).into_response();
    }

    let identity = state.identity.lock().await;
    let devices = state.devices.lock().await;
    if !devices.is_empty() {
        return AppError::AlreadyPaired.into_response();
    }
    if identity.pairing_token.as_deref() != Some(token.as_str()) {
        return AppError::InvalidToken.into_response();
    }

    Json(ServerPublicKeyResponse { server_public_key: identity.key_pair.public_key.clone() }).into_response()
}

/// `POST /pair/{token}` (§4.2): derive the shared secret, mint a device,
/// and consume the token.
async fn pair_post(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(body): Json<PairRequest>,
) -> Response {
    let mut identity = state.identity.lock().await;
    let mut devices = state.devices.lock().await;
    if !devices.is_empty() {
        return AppError::AlreadyPaired.into_response();
    }
    if identity.pairing_token.as_deref() != Some(token.as_str()) {
        return AppError::InvalidToken.into_response();
    }

    let shared_secret = match crypto::derive_shared_secret(&identity.key_pair.private_key, &body.client_public_key) {
        Ok(secret) => secret,
        Err(_) => return AppError::InvalidToken.into_response(),
    };

    let device = match devices.add(body.client_public_key.clone(), shared_secret) {
        Ok(device) => device,
        Err(e) => return AppError::StoreIoFailure(e.to_string()).into_response(),
    };
    if let Err(e) = identity.clear_token() {
        log::warn!("failed to clear pairing token after successful pair: {e}");
    }

    Json(PairResponse { server_public_key: identity.key_pair.public_key.clone(), device_id: device.id }).into_response()
}

#[derive(Debug, Serialize)]
struct ProjectsResponse {
    projects: Vec<crate::project::Project>,
}

async fn list_projects(State(state): State<Arc<AppState>>) -> Response {
    match state.projects.list() {
        Ok(projects) => Json(ProjectsResponse { projects }).into_response(),
        Err(e) => AppError::StoreIoFailure(e.to_string()).into_response(),
    }
}

async fn project_git(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.projects.git_status(&id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn project_conversation(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if let Err(e) = crate::project::validate_project_id(&id) {
        return e.into_response();
    }
    match state.conversations.load(&id).await {
        Ok(conversation) => Json(conversation).into_response(),
        Err(e) => AppError::StoreIoFailure(e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PullRequestInfo {
    url: String,
    number: u64,
    title: String,
    state: String,
}

/// `GET /api/projects/{id}/pr`: best-effort via the `gh` CLI, 404 if
/// unavailable or there is no open PR for the current branch.
async fn project_pr(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let project = match state.projects.get(&id) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };

    let output = tokio::process::Command::new("gh")
        .args(["pr", "view", "--json", "url,number,title,state"])
        .current_dir(&project.path)
        .output()
        .await;

    let Ok(output) = output else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !output.status.success() {
        return StatusCode::NOT_FOUND.into_response();
    }

    match serde_json::from_slice::<PullRequestInfo>(&output.stdout) {
        Ok(info) => Json(info).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct WorktreesResponse {
    worktrees: Vec<crate::project::WorktreeEntry>,
}

async fn list_worktrees(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.projects.list_worktrees(&id) {
        Ok(worktrees) => Json(WorktreesResponse { worktrees }).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateWorktreeRequest {
    branch: String,
}

#[derive(Debug, Serialize)]
struct CreateWorktreeResponse {
    project: crate::project::Project,
}

async fn create_worktree(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CreateWorktreeRequest>,
) -> Response {
    match state.projects.create_worktree(&id, &body.branch) {
        Ok(project) => Json(CreateWorktreeResponse { project }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn remove_worktree(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.projects.remove_worktree(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct VapidPublicKeyResponse {
    #[serde(rename = "publicKey")]
    public_key: String,
}

async fn vapid_public_key(State(state): State<Arc<AppState>>) -> Response {
    Json(VapidPublicKeyResponse { public_key: state.push.vapid_public_key() }).into_response()
}

#[derive(Debug, Deserialize)]
struct PushSubscribeRequest {
    endpoint: String,
    keys: ws::PushKeys,
    #[serde(rename = "deviceId")]
    device_id: String,
}

async fn push_subscribe(State(state): State<Arc<AppState>>, Json(body): Json<PushSubscribeRequest>) -> Response {
    let subscription = PushSubscription { endpoint: body.endpoint, p256dh: body.keys.p256dh, auth: body.keys.auth };
    match state.push.register(body.device_id, subscription) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::StoreIoFailure(e.to_string()).into_response(),
    }
}
