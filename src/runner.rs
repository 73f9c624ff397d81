//! Registry of apps and start-up recovery.
//!
//! On-disk layout: `<working-dir>/<apps-dir>/<name>/` holds the clone, the
//! build output and the runtime socket of app `name`. [`Runner::rehydrate`]
//! relies on this layout to bring previously deployed apps back after a
//! restart.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};

use crate::app::{App, AppSettings};
use crate::config::RunnerConfig;
use crate::errors::{AppError, RunnerError};
use crate::git::{Git2Source, GitAuth, SourceControl};

/// Path segment reserved for the control API.
const RESERVED_NAMES: &[&str] = &["api"];

/// Check that `name` can be used as a URL segment and a directory name.
pub fn validate_name(name: &str) -> Result<(), RunnerError> {
    let invalid = |reason| RunnerError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.starts_with('.') {
        return Err(invalid("name must not start with '.'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid("only ASCII letters, digits, '.', '_' and '-' are allowed"));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(invalid("name is reserved"));
    }
    Ok(())
}

pub struct Runner {
    apps: DashMap<String, Arc<App>>,
    working_dir: PathBuf,
    apps_root: PathBuf,
    settings: Arc<AppSettings>,
}

impl Runner {
    pub fn new(config: &RunnerConfig, source: Arc<dyn SourceControl>) -> Self {
        Self {
            apps: DashMap::new(),
            working_dir: config.working_dir.clone(),
            apps_root: config.apps_root(),
            settings: Arc::new(AppSettings::new(config, source)),
        }
    }

    /// Runner backed by libgit2, with ssh credentials resolved from the
    /// configuration.
    pub fn from_config(config: &RunnerConfig) -> Self {
        let auth = GitAuth::resolve(config.git.ssh_key.as_deref());
        Self::new(config, Arc::new(Git2Source::new(auth)))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn apps_root(&self) -> &Path {
        &self.apps_root
    }

    /// Create a `NEW` app record. Fails if the name is taken or its
    /// directory already exists.
    pub fn register(&self, name: &str, source_url: &str) -> Result<Arc<App>, RunnerError> {
        validate_name(name)?;
        let directory = self.apps_root.join(name);

        match self.apps.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RunnerError::AlreadyExists {
                name: name.to_string(),
                path: directory,
            }),
            Entry::Vacant(slot) => {
                if directory.exists() {
                    return Err(RunnerError::AlreadyExists {
                        name: name.to_string(),
                        path: directory,
                    });
                }
                let app = Arc::new(App::new(
                    name,
                    directory,
                    source_url,
                    Arc::clone(&self.settings),
                ));
                slot.insert(Arc::clone(&app));
                info!(app = %name, url = %source_url, "registered");
                Ok(app)
            }
        }
    }

    pub fn get_app(&self, name: &str) -> Result<Arc<App>, RunnerError> {
        self.apps
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RunnerError::NotFound {
                name: name.to_string(),
            })
    }

    pub async fn start_app(&self, name: &str) -> Result<(), RunnerError> {
        let app = self.get_app(name)?;
        app.start().await?;
        Ok(())
    }

    pub async fn stop_app(&self, name: &str) -> Result<(), RunnerError> {
        let app = self.get_app(name)?;
        app.stop().await?;
        Ok(())
    }

    /// Forget an app. Its process and directory are left alone.
    pub fn delete_app(&self, name: &str) -> Result<Arc<App>, RunnerError> {
        let (_, app) = self.apps.remove(name).ok_or_else(|| RunnerError::NotFound {
            name: name.to_string(),
        })?;
        info!(app = %name, "removed from registry");
        Ok(app)
    }

    /// Snapshot of every registered app, sorted by name.
    pub fn list_apps(&self) -> Vec<Arc<App>> {
        let mut apps: Vec<Arc<App>> = self
            .apps
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        apps.sort_by(|a, b| a.name().cmp(b.name()));
        apps
    }

    /// Register and restart every app found under the apps root.
    ///
    /// Each app is handled on its own: a failed reattach or start leaves the
    /// app registered in its error state and moves on to the next one.
    /// Returns the names that were registered.
    pub async fn rehydrate(&self) -> Result<Vec<String>, RunnerError> {
        let io_err = |source: io::Error| RunnerError::Io {
            path: self.apps_root.clone(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&self.apps_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.apps_root)
                    .await
                    .map_err(io_err)?;
                info!(root = %self.apps_root.display(), "created apps directory");
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_err(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if !entry.file_type().await.map_err(io_err)?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => warn!(entry = ?raw, "skipping app directory with non UTF-8 name"),
            }
        }
        names.sort();

        let mut recovered = Vec::new();
        for name in names {
            if let Err(e) = validate_name(&name) {
                warn!(app = %name, error = %e, "skipping directory");
                continue;
            }
            if self.apps.contains_key(&name) {
                continue;
            }

            let app = Arc::new(App::new(
                name.as_str(),
                self.apps_root.join(&name),
                "",
                Arc::clone(&self.settings),
            ));
            self.apps.insert(name.clone(), Arc::clone(&app));
            recovered.push(name.clone());

            if app.reattach().await.is_err() {
                continue;
            }
            if app.start().await.is_ok() {
                info!(app = %name, "rehydrated");
            }
        }

        info!(count = recovered.len(), "rehydration finished");
        Ok(recovered)
    }

    /// Stop every running app. Failures are collected, not fatal.
    pub async fn stop_all(&self) -> Vec<(String, AppError)> {
        let mut failures = Vec::new();
        for app in self.list_apps() {
            if !app.status().await.is_running() {
                continue;
            }
            match app.stop().await {
                Ok(()) => {}
                // Stopped or deleted concurrently.
                Err(e) if e.is_usage() => {}
                Err(e) => {
                    warn!(app = %app.name(), error = %e, "stop failed during shutdown");
                    failures.push((app.name().to_string(), e));
                }
            }
        }
        failures
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("apps", &self.apps.len())
            .field("apps_root", &self.apps_root)
            .finish_non_exhaustive()
    }
}
