use std::str::FromStr;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::SharedState;
use super::logs;
use crate::app::{App, AppSnapshot};
use crate::errors::{AppError, RunnerError};

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppRequest {
    pub app: String,
    pub git_url: String,
}

#[derive(Deserialize)]
pub struct UpdateAppRequest {
    pub action: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub working_dir: String,
    pub app_count: usize,
    pub apps: Vec<AppSnapshot>,
}

/// Lifecycle actions accepted by `PUT /api/apps/{app}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    /// Stop if running, fetch the source again, start.
    Deploy,
    /// Stop if running, start.
    Restart,
    Start,
    Stop,
}

impl FromStr for AppAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" | "redeploy" => Ok(Self::Deploy),
            "restart" => Ok(Self::Restart),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            _ => Err(format!("Invalid action: {}", s)),
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

/// Error response: JSON `{"app": <snapshot or null>, "error": "<text>"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    app: Option<AppSnapshot>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            app: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            app: None,
        }
    }

    /// Error from an app operation, reported together with the app's state
    /// after the failure.
    pub async fn for_app(app: &App, err: AppError) -> Self {
        let mut api_err = Self::from(err);
        api_err.app = Some(app.describe().await);
        api_err
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn app_error_status(err: &AppError) -> StatusCode {
    match err {
        AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
        AppError::NotRunning { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Dispatch(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self {
            status: app_error_status(&err),
            message: err.to_string(),
            app: None,
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        let status = match &err {
            RunnerError::NotFound { .. } => StatusCode::NOT_FOUND,
            RunnerError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            RunnerError::AlreadyExists { .. } => StatusCode::CONFLICT,
            RunnerError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RunnerError::App(inner) => app_error_status(inner),
        };
        Self {
            status,
            message: err.to_string(),
            app: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"app": self.app, "error": self.message})),
        )
            .into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/apps", get(list_apps).post(create_app))
        .route(
            "/api/apps/{app}",
            get(get_app).put(update_app).delete(delete_app),
        )
        .route("/api/apps/{app}/stdout", get(logs::stdout))
        .route("/api/apps/{app}/stderr", get(logs::stderr))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let mut apps = Vec::new();
    for app in state.runner.list_apps() {
        apps.push(app.describe().await);
    }
    Json(HealthResponse {
        status: "ok",
        working_dir: state.runner.working_dir().display().to_string(),
        app_count: apps.len(),
        apps,
    })
}

async fn list_apps(State(state): State<SharedState>) -> Json<Vec<AppSnapshot>> {
    let mut apps = Vec::new();
    for app in state.runner.list_apps() {
        apps.push(app.describe().await);
    }
    Json(apps)
}

/// Register, clone and start a new app.
async fn create_app(
    State(state): State<SharedState>,
    Json(req): Json<CreateAppRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.git_url.trim().is_empty() {
        return Err(ApiError::bad_request("gitUrl is required"));
    }

    let app = state.runner.register(&req.app, &req.git_url)?;
    if let Err(e) = app.deploy(&req.git_url).await {
        return Err(ApiError::for_app(&app, e).await);
    }
    if let Err(e) = app.start().await {
        return Err(ApiError::for_app(&app, e).await);
    }

    Ok((StatusCode::CREATED, Json(app.describe().await)))
}

async fn get_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<AppSnapshot>, ApiError> {
    let app = state.runner.get_app(&name)?;
    Ok(Json(app.describe().await))
}

async fn update_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateAppRequest>,
) -> Result<Json<AppSnapshot>, ApiError> {
    let action: AppAction = req.action.parse().map_err(ApiError::bad_request)?;
    let app = state.runner.get_app(&name)?;
    info!(app = %name, ?action, "app action requested");

    if let Err(e) = apply_action(&app, action).await {
        return Err(ApiError::for_app(&app, e).await);
    }
    Ok(Json(app.describe().await))
}

async fn apply_action(app: &App, action: AppAction) -> Result<(), AppError> {
    match action {
        AppAction::Deploy => {
            stop_if_running(app).await?;
            app.rebuild().await?;
            app.start().await
        }
        AppAction::Restart => {
            stop_if_running(app).await?;
            app.start().await
        }
        AppAction::Start => app.start().await,
        AppAction::Stop => app.stop().await,
    }
}

async fn stop_if_running(app: &App) -> Result<(), AppError> {
    match app.stop().await {
        Ok(()) | Err(AppError::NotRunning { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Stop, purge and forget an app.
async fn delete_app(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<AppSnapshot>, ApiError> {
    let app = state.runner.get_app(&name)?;
    if let Err(e) = stop_if_running(&app).await {
        return Err(ApiError::for_app(&app, e).await);
    }
    if let Err(e) = app.purge().await {
        return Err(ApiError::for_app(&app, e).await);
    }
    state.runner.delete_app(&name)?;
    Ok(Json(app.describe().await))
}
