//! HTTP front door: control API under `/api`, everything else proxied to
//! apps by their first path segment.

mod api;
mod logs;
mod proxy;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::any;
use tokio::signal::unix::{SignalKind, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::runner::Runner;

pub use api::ApiError;

/// Shared state handed to every handler.
pub struct ServerState {
    pub runner: Runner,
    /// Capacity of each log viewer's subscriber channel.
    pub subscriber_capacity: usize,
    /// Lines a log viewer keeps before overwriting the oldest.
    pub log_backlog: usize,
}

impl ServerState {
    pub fn new(runner: Runner, config: &RunnerConfig) -> Self {
        Self {
            runner,
            subscriber_capacity: config.runtime.subscriber_capacity,
            log_backlog: config.runtime.log_backlog,
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Build the full router: API routes, then the catch-all app proxy.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/{app}", any(proxy::proxy))
        .route("/{app}/{*path}", any(proxy::proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rehydrate apps, serve until Ctrl+C or SIGTERM, then stop every app.
pub async fn start_server(config: RunnerConfig) -> Result<()> {
    let runner = Runner::from_config(&config);
    let recovered = runner
        .rehydrate()
        .await
        .context("Failed to rehydrate apps")?;
    info!(count = recovered.len(), apps = ?recovered, "apps recovered");

    let state = Arc::new(ServerState::new(runner, &config));
    let app = build_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, working_dir = %config.working_dir.display(), "apprunner listening");

    // Stopping the apps first closes their log streams, which lets the
    // server drain its open connections.
    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stop_all(&shutdown_state.runner).await;
        })
        .await
        .context("Server error")?;

    stop_all(&state.runner).await;
    info!("server shut down gracefully");
    Ok(())
}

async fn stop_all(runner: &Runner) {
    for (name, err) in runner.stop_all().await {
        warn!(app = %name, error = %err, "app did not stop cleanly");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::git::{Git2Source, GitAuth};

    pub(crate) fn test_state(working_dir: &Path) -> SharedState {
        let config = RunnerConfig::new(working_dir);
        let runner = Runner::new(&config, Arc::new(Git2Source::new(GitAuth::Agent)));
        Arc::new(ServerState::new(runner, &config))
    }

    pub(crate) async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_proxy_unknown_app_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path()));
        let req = Request::builder()
            .uri("/ghost/greeting")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "App ghost not found");
        assert!(json["app"].is_null());
    }

    #[tokio::test]
    async fn test_proxy_idle_app_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state.runner.register("idle", "u").unwrap();
        let app = build_router(state);

        for uri in ["/idle", "/idle/deep/path?x=1"] {
            let req = Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
            let json = body_json(resp).await;
            assert_eq!(json["app"]["status"], "NEW");
        }
    }
}
