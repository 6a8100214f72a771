//! HTTP + WebSocket server assembly: route table, auth middleware, and
//! graceful shutdown — the same `axum::serve(...).with_graceful_shutdown`
//! shape this codebase's daemon server already used, generalized to this
//! crate's route set.

use crate::config::Config;
use crate::dev_terminal::DevTerminal;
use crate::dirs;
use crate::error::{ok, AppError};
use crate::hub::{self, HubState};
use crate::path_guard;
use crate::registry::{Registry, SessionEntry};
use crate::token_store::TokenStore;
use axum::error_handling::HandleErrorLayer;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{BoxError, Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tower::timeout::TimeoutLayer;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

const DEFAULT_HTTP_IDLE_TIMEOUT_SECS: u64 = 120;

pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub config_path: PathBuf,
    pub registry: Arc<Registry>,
    pub tokens: Arc<TokenStore>,
    pub dev: Arc<DevTerminal>,
    /// Process-start reference point; session `createdAt`/`lastActivity`
    /// projections report milliseconds elapsed since this instant rather
    /// than pulling in a wall-clock dependency this crate doesn't
    /// otherwise need.
    pub started_at: Instant,
}

impl AppState {
    pub async fn allowed_dirs(&self) -> Vec<PathBuf> {
        self.config.read().await.allowed_dirs.clone()
    }

    fn millis_since_start(&self, instant: Instant) -> u64 {
        instant
            .saturating_duration_since(self.started_at)
            .as_millis() as u64
    }
}

/// `BUN_IDLE_TIMEOUT`-configurable HTTP request idle timeout, applied to
/// the REST surface only — never to the `/ws*` routes, whose whole point
/// is to stay open for the lifetime of a terminal session.
fn http_idle_timeout() -> Duration {
    std::env::var("BUN_IDLE_TIMEOUT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_HTTP_IDLE_TIMEOUT_SECS))
}

async fn handle_idle_timeout(err: BoxError) -> Response {
    let (status, message) = if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "request idle timeout exceeded".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    };
    (
        status,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match extract_bearer(&headers) {
        Some(token) if state.tokens.verify(&token).await => next.run(request).await,
        _ => AppError::Unauthorized.into_response(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/auth", axum::routing::delete(auth_clear))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/dirs", get(list_dirs))
        .route("/api/dirs/breadcrumbs", get(dirs_breadcrumbs))
        .route(
            "/api/sessions",
            get(list_sessions).post(create_session),
        )
        .route(
            "/api/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/:id/stop", axum::routing::post(stop_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let public = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/init", axum::routing::post(auth_init))
        .route("/api/auth/verify", axum::routing::post(auth_verify))
        // Rotation proves possession of the current token in its body, so
        // it is ungated at the HTTP layer like the other auth bootstrap
        // routes — matching the route table exactly.
        .route("/api/auth", axum::routing::put(auth_rotate));

    let http = public.merge(protected).layer(
        tower::ServiceBuilder::new()
            .layer(HandleErrorLayer::new(handle_idle_timeout))
            .layer(TimeoutLayer::new(http_idle_timeout())),
    );

    let hub_state = Arc::new(HubState {
        registry: state.registry.clone(),
        tokens: state.tokens.clone(),
        dev: state.dev.clone(),
    });
    let ws_routes = Router::new()
        .route("/ws", get(hub::session_ws))
        .route("/ws/dev", get(hub::dev_ws))
        .with_state(hub_state);

    Router::new()
        .merge(http)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    ok(serde_json::json!({ "status": "ok" }))
}

async fn auth_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ok(serde_json::json!({ "hasToken": state.tokens.status().await }))
}

#[derive(Deserialize)]
struct InitBody {
    token: String,
}

async fn auth_init(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitBody>,
) -> Result<impl IntoResponse, AppError> {
    state.tokens.init(&body.token).await?;
    Ok(ok(serde_json::json!({ "initialized": true })))
}

#[derive(Deserialize)]
struct VerifyBody {
    token: String,
}

async fn auth_verify(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyBody>,
) -> impl IntoResponse {
    ok(serde_json::json!({ "valid": state.tokens.verify(&body.token).await }))
}

#[derive(Deserialize)]
struct RotateBody {
    current: String,
    next: String,
}

async fn auth_rotate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RotateBody>,
) -> Result<impl IntoResponse, AppError> {
    state.tokens.rotate(&body.current, &body.next).await?;
    Ok(ok(serde_json::json!({ "rotated": true })))
}

async fn auth_clear(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    state.tokens.clear().await?;
    Ok(ok(serde_json::json!({ "cleared": true })))
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ok(state.config.read().await.public_view())
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<serde_json::Value>,
) -> Result<impl IntoResponse, AppError> {
    let mut config = state.config.write().await;
    config
        .apply_patch(patch)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    config
        .save(&state.config_path)
        .map_err(|e| AppError::Fatal(e.to_string()))?;
    Ok(ok(config.public_view()))
}

#[derive(Deserialize)]
struct PathQuery {
    path: PathBuf,
}

async fn list_dirs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, AppError> {
    let allowed = state.allowed_dirs().await;
    let entries = dirs::list(&query.path, &allowed)?;
    Ok(ok(entries))
}

async fn dirs_breadcrumbs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, AppError> {
    let allowed = state.allowed_dirs().await;
    let crumbs = dirs::breadcrumbs(&query.path, &allowed)?;
    Ok(ok(crumbs))
}

#[derive(Deserialize)]
struct CreateSessionBody {
    path: PathBuf,
    #[serde(rename = "aiCommandId", default)]
    ai_command_id: Option<Uuid>,
}

async fn session_projection(entry: &SessionEntry, state: &AppState) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id,
        "workingDir": entry.working_dir,
        "aiCommand": entry.ai_command,
        "status": entry.status().await.as_wire(),
        "createdAt": state.millis_since_start(entry.created_at),
        "lastActivity": state.millis_since_start(entry.last_activity().await),
    })
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, AppError> {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    if body.path.as_os_str().is_empty() {
        return Err(AppError::BadRequest("path is required".to_string()));
    }
    if !body.path.exists() {
        return Err(AppError::BadRequest(format!(
            "path does not exist: {}",
            body.path.display()
        )));
    }

    let allowed = state.allowed_dirs().await;
    if !path_guard::admit(&body.path, &allowed) {
        return Err(AppError::Forbidden(format!(
            "working directory not allowed: {}",
            body.path.display()
        )));
    }

    let ai_command = {
        let config = state.config.read().await;
        match body.ai_command_id {
            Some(wanted) => config
                .ai_commands
                .iter()
                .find(|c| c.id == wanted)
                .map(|c| c.cmd.clone())
                .ok_or_else(|| AppError::BadRequest("unknown aiCommandId".to_string()))?,
            None => config
                .ai_commands
                .iter()
                .find(|c| c.enabled)
                .map(|c| c.cmd.clone())
                .unwrap_or_else(|| "claude".to_string()),
        }
    };

    let id = state.registry.create(body.path, ai_command);
    let entry = state.registry.get(id).expect("just created");
    let ws_url = format!("ws://{host}/ws?sessionId={id}");
    Ok((
        StatusCode::CREATED,
        ok(serde_json::json!({
            "session": session_projection(&entry, &state).await,
            "wsUrl": ws_url,
        })),
    ))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut sessions = Vec::new();
    for entry in state.registry.list() {
        sessions.push(session_projection(&entry, &state).await);
    }
    ok(sessions)
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let entry = state.registry.get(id).ok_or(AppError::NotFound)?;
    Ok(ok(session_projection(&entry, &state).await))
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if !state.registry.exists(id) {
        return Err(AppError::NotFound);
    }
    state.registry.terminate(id).await;
    Ok(ok(serde_json::json!({ "status": "terminated" })))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if !state.registry.exists(id) {
        return Err(AppError::NotFound);
    }
    state.registry.delete(id).await;
    Ok(ok(serde_json::json!({ "deleted": true })))
}

pub async fn run_server(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

/// Graceful shutdown: terminate every live session and the shared dev PTY
/// before the server lets `axum::serve` return. Actual client-socket
/// closure with code 1001 happens naturally as each session's broadcast
/// channel is dropped out from under `serve_session`'s receiver; the
/// bound here is the fixed set of `terminate` calls below, not a wait on
/// client acknowledgement.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutting down, terminating sessions");
    for entry in state.registry.list() {
        state.registry.terminate(entry.id).await;
    }
    state.dev.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config as AppConfig;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let config = AppConfig::defaults_from_env();
        config.save(&config_path).unwrap();
        let config = Arc::new(RwLock::new(config));
        let tokens = Arc::new(TokenStore::new(
            config.clone(),
            config_path.clone(),
            dir.path().join(".clicast-token"),
        ));
        let state = Arc::new(AppState {
            config,
            config_path,
            registry: Registry::new(),
            tokens,
            dev: DevTerminal::new(),
            started_at: Instant::now(),
        });
        (state, dir)
    }

    #[tokio::test]
    async fn health_is_public() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_status_reports_no_token_initially() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/auth/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"]["hasToken"], false);
    }

    #[tokio::test]
    async fn config_requires_auth() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/config")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn config_accessible_with_valid_token() {
        let (state, _dir) = test_state().await;
        state.tokens.init("correcthorsebattery").await.unwrap();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/config")
                    .header("Authorization", "Bearer correcthorsebattery")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_rotate_route_is_ungated_and_requires_current() {
        let (state, _dir) = test_state().await;
        state.tokens.init("correcthorsebattery").await.unwrap();
        let app = router(state.clone());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/api/auth")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::json!({"current": "correcthorsebattery", "next": "newsecretvalue"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.tokens.verify("newsecretvalue").await);
    }

    #[tokio::test]
    async fn auth_clear_route_requires_token() {
        let (state, _dir) = test_state().await;
        state.tokens.init("correcthorsebattery").await.unwrap();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/api/auth")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_create_rejects_disallowed_dir() {
        let (state, _dir) = test_state().await;
        state.tokens.init("correcthorsebattery").await.unwrap();
        state.config.write().await.allowed_dirs = vec![PathBuf::from("/srv/allowed")];
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/sessions")
                    .header("Authorization", "Bearer correcthorsebattery")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::json!({"path": "/etc"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn session_create_rejects_nonexistent_path() {
        let (state, _dir) = test_state().await;
        state.tokens.init("correcthorsebattery").await.unwrap();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/sessions")
                    .header("Authorization", "Bearer correcthorsebattery")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::json!({"path": "/this/does/not/exist"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn session_create_returns_session_and_ws_url_without_spawning() {
        let (state, _dir) = test_state().await;
        state.tokens.init("correcthorsebattery").await.unwrap();
        let app = router(state.clone());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/sessions")
                    .header("Authorization", "Bearer correcthorsebattery")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        serde_json::json!({"path": "/tmp"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"]["session"]["status"], "created");
        assert!(json["data"]["wsUrl"].as_str().unwrap().contains("/ws?sessionId="));

        let id: Uuid = json["data"]["session"]["id"].as_str().unwrap().parse().unwrap();
        let entry = state.registry.get(id).unwrap();
        assert_eq!(
            entry.status().await,
            crate::registry::SessionStatus::Created
        );
    }

    #[tokio::test]
    async fn stop_session_reports_terminated_status() {
        let (state, _dir) = test_state().await;
        state.tokens.init("correcthorsebattery").await.unwrap();
        let id = state
            .registry
            .create(PathBuf::from("/tmp"), "true".to_string());
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/api/sessions/{id}/stop"))
                    .header("Authorization", "Bearer correcthorsebattery")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"]["status"], "terminated");
    }

    #[tokio::test]
    async fn stop_unknown_session_is_not_found() {
        let (state, _dir) = test_state().await;
        state.tokens.init("correcthorsebattery").await.unwrap();
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/api/sessions/{}/stop", Uuid::new_v4()))
                    .header("Authorization", "Bearer correcthorsebattery")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
