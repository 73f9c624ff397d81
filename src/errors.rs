//! Typed error hierarchy for the app runner.
//!
//! Two enums cover the two layers:
//! - `AppError`: lifecycle failures of a single app
//! - `RunnerError`: registry failures, wrapping `AppError`

use std::path::PathBuf;

use thiserror::Error;

use crate::app::AppStatus;

/// Errors from one app's lifecycle operations.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Failed to remove app directory {path}: {source}")]
    Purge {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to clone {url}: {source:#}")]
    GitClone {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read git metadata: {0:#}")]
    GitLog(#[source] anyhow::Error),

    #[error("Build failed: {message}")]
    Build { message: String },

    #[error("Failed to start app: {0:#}")]
    Start(#[source] anyhow::Error),

    #[error("Cannot {action} app: status={status}")]
    InvalidTransition {
        action: &'static str,
        status: AppStatus,
    },

    #[error("App not started: status={status}")]
    NotRunning { status: AppStatus },

    #[error("Failed to dispatch request: {0:#}")]
    Dispatch(#[source] anyhow::Error),

    #[error("Failed to stop app: {0}")]
    Stop(#[source] std::io::Error),
}

impl AppError {
    /// Usage errors leave the app untouched and are never persisted.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            AppError::InvalidTransition { .. } | AppError::NotRunning { .. }
        )
    }
}

/// Errors from the app registry.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("App {name} not found")]
    NotFound { name: String },

    #[error("App {name} already exists at {path}")]
    AlreadyExists { name: String, path: PathBuf },

    #[error("Invalid app name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    App(#[from] AppError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::FailureStage;

    #[test]
    fn app_error_purge_carries_path() {
        let path = PathBuf::from("/srv/apps/hello");
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = AppError::Purge {
            path: path.clone(),
            source: io_err,
        };
        match &err {
            AppError::Purge { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Purge"),
        }
        assert!(err.to_string().contains("/srv/apps/hello"));
    }

    #[test]
    fn app_error_not_running_reports_status() {
        let err = AppError::NotRunning {
            status: AppStatus::Stopped,
        };
        assert_eq!(err.to_string(), "App not started: status=STOPPED");
        assert!(err.is_usage());
    }

    #[test]
    fn app_error_invalid_transition_reports_action_and_status() {
        let err = AppError::InvalidTransition {
            action: "start",
            status: AppStatus::Started,
        };
        assert_eq!(err.to_string(), "Cannot start app: status=STARTED");
        assert!(err.is_usage());
    }

    #[test]
    fn app_error_build_is_not_usage() {
        let err = AppError::Build {
            message: "error[E0425]: cannot find value".to_string(),
        };
        assert!(!err.is_usage());
        assert!(err.to_string().contains("E0425"));
    }

    #[test]
    fn app_error_git_clone_includes_context_chain() {
        let source = anyhow::anyhow!("repository not found").context("Failed to clone");
        let err = AppError::GitClone {
            url: "https://example.com/x.git".to_string(),
            source,
        };
        let text = err.to_string();
        assert!(text.contains("https://example.com/x.git"));
        assert!(text.contains("repository not found"));
    }

    #[test]
    fn runner_error_converts_from_app_error() {
        let inner = AppError::NotRunning {
            status: AppStatus::Failed(FailureStage::Build),
        };
        let err: RunnerError = inner.into();
        match &err {
            RunnerError::App(AppError::NotRunning { status }) => {
                assert_eq!(*status, AppStatus::Failed(FailureStage::Build));
            }
            _ => panic!("Expected RunnerError::App(NotRunning)"),
        }
        assert_eq!(err.to_string(), "App not started: status=ERR:BUILD");
    }

    #[test]
    fn runner_error_not_found_names_app() {
        let err = RunnerError::NotFound {
            name: "ghost".to_string(),
        };
        assert_eq!(err.to_string(), "App ghost not found");
    }
}
