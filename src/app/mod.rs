//! Lifecycle engine for one deployed application.
//!
//! An [`App`] owns a private working tree under the apps root. It clones the
//! source into it, builds it, runs the artifact as a child process listening
//! on a unix socket inside the same directory, and forwards HTTP requests to
//! that socket. All lifecycle operations hold the app's lock for their full
//! duration, so at most one transition per app is ever in flight.

mod dispatch;
mod process;
mod status;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Body;
use axum::http::{Request, Response};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::config::{BuildConfig, RunnerConfig, RuntimeConfig};
use crate::errors::AppError;
use crate::git::{CommitInfo, SourceControl};
use crate::isolation::{IsolationConfig, ResourceGroup};
use crate::topic::{SubscriberId, Topic};

pub use dispatch::{UnixTransport, rewrite_uri};
pub use status::{AppSnapshot, AppStatus, FailureStage};

use process::ProcessHandle;

/// Grace period for tearing down a process that never became ready.
const ABORT_GRACE: Duration = Duration::from_secs(2);

/// Settings shared by every app of a runner.
pub struct AppSettings {
    pub build: BuildConfig,
    pub runtime: RuntimeConfig,
    pub isolation: IsolationConfig,
    pub source: Arc<dyn SourceControl>,
}

impl AppSettings {
    pub fn new(config: &RunnerConfig, source: Arc<dyn SourceControl>) -> Self {
        Self {
            build: config.build.clone(),
            runtime: config.runtime.clone(),
            isolation: config.isolation.clone(),
            source,
        }
    }
}

/// Which output pipe of the running process to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A live log registration. Dropping it without calling
/// [`unsubscribe`](Self::unsubscribe) keeps the channel registered until the
/// app stops.
#[derive(Debug)]
pub struct LogSubscription {
    topic: Arc<Topic>,
    id: SubscriberId,
}

impl LogSubscription {
    pub fn unsubscribe(&self) -> bool {
        self.topic.unsubscribe(self.id)
    }
}

/// Everything that exists only while the process is running.
struct Run {
    process: ProcessHandle,
    transport: Arc<UnixTransport>,
    stdout: Arc<Topic>,
    stderr: Arc<Topic>,
    group: Box<dyn ResourceGroup>,
}

impl Run {
    /// Terminate the process, drain its pumps and close both topics. The
    /// topics and group are released even when termination fails.
    async fn shutdown(&mut self, grace: Duration) -> io::Result<i32> {
        let exit = self.process.terminate(grace).await;
        self.process.join_pumps(grace).await;
        self.stdout.close();
        self.stderr.close();
        if let Err(e) = self.group.delete() {
            warn!(pid = self.process.pid(), error = %e, "failed to delete resource group");
        }
        if let Err(e) = std::fs::remove_file(self.transport.socket())
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(socket = %self.transport.socket().display(), error = %e, "failed to remove socket");
        }
        exit
    }
}

struct AppState {
    source_url: String,
    status: AppStatus,
    last_error: Option<String>,
    commit: Option<CommitInfo>,
    run: Option<Run>,
    last_exit: Option<i32>,
}

pub struct App {
    name: String,
    directory: PathBuf,
    settings: Arc<AppSettings>,
    state: Mutex<AppState>,
}

impl App {
    pub fn new(
        name: impl Into<String>,
        directory: impl Into<PathBuf>,
        source_url: impl Into<String>,
        settings: Arc<AppSettings>,
    ) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            settings,
            state: Mutex::new(AppState {
                source_url: source_url.into(),
                status: AppStatus::New,
                last_error: None,
                commit: None,
                run: None,
                last_exit: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn status(&self) -> AppStatus {
        self.state.lock().await.status
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Replace the working tree with a fresh clone of `url`.
    pub async fn deploy(&self, url: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        self.ensure_not_running(&state, "deploy")?;
        state.source_url = url.to_string();
        self.clone_fresh(&mut state).await
    }

    /// Replace the working tree with a fresh clone of the stored source URL.
    pub async fn rebuild(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        self.ensure_not_running(&state, "rebuild")?;
        self.clone_fresh(&mut state).await
    }

    /// Build the working tree and launch the artifact.
    pub async fn start(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if matches!(state.status, AppStatus::Started | AppStatus::Deleted) {
            return Err(AppError::InvalidTransition {
                action: "start",
                status: state.status,
            });
        }

        let command = self.settings.build.command_for(&self.name);
        info!(app = %self.name, command = %command.join(" "), "building");
        if let Err(e) = process::build(&self.directory, &command).await {
            return Err(self.fail(&mut state, FailureStage::Build, e));
        }

        let run = match self.launch().await {
            Ok(run) => run,
            Err(e) => return Err(self.fail(&mut state, FailureStage::Start, AppError::Start(e))),
        };

        info!(app = %self.name, pid = run.process.pid(), "started");
        state.run = Some(run);
        state.status = AppStatus::Started;
        state.last_error = None;
        state.last_exit = None;
        Ok(())
    }

    /// Terminate the running process and close every log stream.
    pub async fn stop(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let mut run = match (state.status, state.run.take()) {
            (AppStatus::Started, Some(run)) => run,
            (status, run) => {
                state.run = run;
                return Err(AppError::NotRunning { status });
            }
        };

        let pid = run.process.pid();
        let result = run.shutdown(self.settings.runtime.stop_timeout()).await;
        state.status = AppStatus::Stopped;
        match result {
            Ok(code) => {
                info!(app = %self.name, pid, exit = code, "stopped");
                state.last_exit = Some(code);
                state.last_error = None;
                Ok(())
            }
            Err(e) => {
                let err = AppError::Stop(e);
                warn!(app = %self.name, pid, error = %err, "stop failed");
                state.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Remove the working tree. The app cannot be started again.
    pub async fn purge(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        self.ensure_not_running(&state, "purge")?;
        if let Err(e) = self.remove_directory().await {
            return Err(self.fail(&mut state, FailureStage::Purge, e));
        }
        info!(app = %self.name, "purged");
        state.status = AppStatus::Deleted;
        state.commit = None;
        state.last_error = None;
        Ok(())
    }

    /// Recover the source URL and commit from an existing working tree.
    pub async fn reattach(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        self.ensure_not_running(&state, "reattach")?;

        let git = Arc::clone(&self.settings.source);
        let dir = self.directory.clone();
        let recovered = blocking(move || {
            let url = git.remote_url(&dir)?;
            let commit = git.head_commit(&dir)?;
            Ok((url, commit))
        })
        .await;

        match recovered {
            Ok((url, commit)) => {
                info!(app = %self.name, url = %url, commit = %commit.hash, "reattached");
                state.source_url = url;
                state.commit = Some(commit);
                state.status = AppStatus::New;
                state.last_error = None;
                Ok(())
            }
            Err(e) => Err(self.fail(&mut state, FailureStage::GitLog, AppError::GitLog(e))),
        }
    }

    // ── Traffic ──────────────────────────────────────────────────────

    /// Forward `req` to the running process with the `/<name>` prefix
    /// stripped from its path.
    pub async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, AppError> {
        let transport = {
            let state = self.state.lock().await;
            match (&state.status, &state.run) {
                (AppStatus::Started, Some(run)) => Arc::clone(&run.transport),
                (status, _) => return Err(AppError::NotRunning { status: *status }),
            }
        };

        let (mut parts, body) = req.into_parts();
        parts.uri = rewrite_uri(&self.name, &parts.uri).map_err(AppError::Dispatch)?;
        transport
            .send(Request::from_parts(parts, body))
            .await
            .map_err(AppError::Dispatch)
    }

    /// Register `sink` for every line the process writes to `stream`.
    pub async fn stream(
        &self,
        stream: OutputStream,
        sink: mpsc::Sender<String>,
    ) -> Result<LogSubscription, AppError> {
        let topic = {
            let state = self.state.lock().await;
            match &state.run {
                Some(run) => match stream {
                    OutputStream::Stdout => Arc::clone(&run.stdout),
                    OutputStream::Stderr => Arc::clone(&run.stderr),
                },
                None => return Err(AppError::NotRunning { status: state.status }),
            }
        };
        let id = topic.subscribe(sink);
        Ok(LogSubscription { topic, id })
    }

    pub async fn stream_stdout(
        &self,
        sink: mpsc::Sender<String>,
    ) -> Result<LogSubscription, AppError> {
        self.stream(OutputStream::Stdout, sink).await
    }

    pub async fn stream_stderr(
        &self,
        sink: mpsc::Sender<String>,
    ) -> Result<LogSubscription, AppError> {
        self.stream(OutputStream::Stderr, sink).await
    }

    /// Consistent snapshot of the app's state.
    pub async fn describe(&self) -> AppSnapshot {
        let state = self.state.lock().await;
        AppSnapshot {
            name: self.name.clone(),
            git_url: state.source_url.clone(),
            git_commit: state
                .commit
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            commit: state.commit.clone(),
            status: state.status,
            app_dir: self.directory.clone(),
            last_error: state.last_error.clone(),
            pid: state.run.as_ref().map(|run| run.process.pid()),
            exit: state.last_exit,
            cmd: state
                .run
                .as_ref()
                .map(|run| run.process.command_line().to_string()),
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn ensure_not_running(&self, state: &AppState, action: &'static str) -> Result<(), AppError> {
        if state.status.is_running() {
            return Err(AppError::InvalidTransition {
                action,
                status: state.status,
            });
        }
        Ok(())
    }

    /// Record a failed transition and hand the error back to the caller.
    fn fail(&self, state: &mut AppState, stage: FailureStage, err: AppError) -> AppError {
        state.status = AppStatus::Failed(stage);
        state.last_error = Some(err.to_string());
        warn!(app = %self.name, status = %state.status, error = %err, "lifecycle operation failed");
        err
    }

    async fn remove_directory(&self) -> Result<(), AppError> {
        match tokio::fs::remove_dir_all(&self.directory).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AppError::Purge {
                path: self.directory.clone(),
                source,
            }),
        }
    }

    async fn clone_fresh(&self, state: &mut AppState) -> Result<(), AppError> {
        if let Err(e) = self.remove_directory().await {
            return Err(self.fail(state, FailureStage::Purge, e));
        }

        let url = state.source_url.clone();
        info!(app = %self.name, url = %url, "cloning");
        let git = Arc::clone(&self.settings.source);
        let dest = self.directory.clone();
        let cloned = {
            let url = url.clone();
            blocking(move || {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                git.clone_repo(&url, &dest)
            })
            .await
        };
        if let Err(source) = cloned {
            return Err(self.fail(state, FailureStage::GitClone, AppError::GitClone { url, source }));
        }

        let git = Arc::clone(&self.settings.source);
        let dir = self.directory.clone();
        match blocking(move || git.head_commit(&dir)).await {
            Ok(commit) => {
                info!(app = %self.name, commit = %commit.hash, "deployed");
                state.commit = Some(commit);
                state.status = AppStatus::New;
                state.last_error = None;
                Ok(())
            }
            Err(e) => Err(self.fail(state, FailureStage::GitLog, AppError::GitLog(e))),
        }
    }

    async fn launch(&self) -> anyhow::Result<Run> {
        let runtime = &self.settings.runtime;
        let socket = self.directory.join(&runtime.socket_name);
        match std::fs::remove_file(&socket) {
            Ok(()) => info!(app = %self.name, "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale socket {}", socket.display())
                });
            }
        }

        let program = self
            .directory
            .join(self.settings.build.artifact_for(&self.name));
        let socket_arg = socket
            .to_str()
            .context("Socket path is not valid UTF-8")?
            .to_string();
        let args = [runtime.socket_flag.clone(), socket_arg];

        let group = self
            .settings
            .isolation
            .group_for(&self.name)
            .context("Failed to create resource group")?;

        let stdout = Arc::new(Topic::new());
        let stderr = Arc::new(Topic::new());
        let process = ProcessHandle::spawn(
            &self.name,
            &self.directory,
            &program,
            &args,
            Arc::clone(&stdout),
            Arc::clone(&stderr),
        )?;

        let mut run = Run {
            process,
            transport: Arc::new(UnixTransport::new(&socket)),
            stdout,
            stderr,
            group,
        };

        let pid = run.process.pid();
        let ready = match run.group.add(pid) {
            Ok(()) => {
                dispatch::wait_until_ready(
                    &socket,
                    &mut run.process,
                    runtime.ready_timeout(),
                    runtime.ready_poll(),
                )
                .await
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to add process to resource group")),
        };

        if let Err(e) = ready {
            if let Err(stop_err) = run.shutdown(ABORT_GRACE).await {
                warn!(app = %self.name, pid, error = %stop_err, "failed to kill unready process");
            }
            return Err(e);
        }
        Ok(run)
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

/// Run a blocking source-control call on the blocking pool.
async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Source control task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::git::tests::{commit_files, init_repo};
    use crate::git::{Git2Source, GitAuth};

    fn settings(command: &[&str], artifact: &str) -> Arc<AppSettings> {
        let mut config = RunnerConfig::new("/unused");
        config.build.command = command.iter().map(|s| s.to_string()).collect();
        config.build.artifact = artifact.to_string();
        config.runtime.ready_timeout_ms = 1_000;
        config.runtime.ready_poll_ms = 10;
        config.runtime.stop_timeout_ms = 1_000;
        Arc::new(AppSettings::new(
            &config,
            Arc::new(Git2Source::new(GitAuth::Agent)),
        ))
    }

    fn fixture() -> (tempfile::TempDir, String, tempfile::TempDir) {
        let upstream = tempfile::tempdir().unwrap();
        init_repo(upstream.path(), &[("main.txt", "v1\n")], "first release");
        let url = upstream.path().to_str().unwrap().to_string();
        (upstream, url, tempfile::tempdir().unwrap())
    }

    #[tokio::test]
    async fn test_deploy_clones_and_records_commit() {
        let (_upstream, url, work) = fixture();
        let app = App::new("demo", work.path().join("apps/demo"), "", settings(&["true"], "x"));

        app.deploy(&url).await.unwrap();
        assert_eq!(app.status().await, AppStatus::New);
        assert!(work.path().join("apps/demo/main.txt").is_file());

        let snapshot = app.describe().await;
        assert_eq!(snapshot.git_url, url);
        assert!(snapshot.git_commit.contains("first release"));
        assert_eq!(snapshot.commit.unwrap().message, "first release");
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.pid.is_none());
    }

    #[tokio::test]
    async fn test_rebuild_discards_local_changes() {
        let (upstream, url, work) = fixture();
        let dir = work.path().join("demo");
        let app = App::new("demo", &dir, url.as_str(), settings(&["true"], "x"));
        app.rebuild().await.unwrap();

        fs::write(dir.join("main.txt"), "local edit").unwrap();
        fs::write(dir.join("scratch.txt"), "junk").unwrap();
        let repo = git2::Repository::open(upstream.path()).unwrap();
        commit_files(&repo, &[("main.txt", "v2\n")], "second release");

        app.rebuild().await.unwrap();
        assert_eq!(fs::read_to_string(dir.join("main.txt")).unwrap(), "v2\n");
        assert!(!dir.join("scratch.txt").exists());
        assert_eq!(app.status().await, AppStatus::New);
        assert!(app.describe().await.git_commit.contains("second release"));
    }

    #[tokio::test]
    async fn test_deploy_bad_url_is_gitclone_failure() {
        let work = tempfile::tempdir().unwrap();
        let app = App::new("demo", work.path().join("demo"), "", settings(&["true"], "x"));
        let missing = work.path().join("no-such-repo");

        let err = app.deploy(missing.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, AppError::GitClone { .. }));
        let snapshot = app.describe().await;
        assert_eq!(snapshot.status, AppStatus::Failed(FailureStage::GitClone));
        assert_eq!(snapshot.last_error, Some(err.to_string()));
    }

    #[tokio::test]
    async fn test_failed_build_is_recorded_and_recoverable() {
        let (_upstream, url, work) = fixture();
        let app = App::new(
            "demo",
            work.path().join("demo"),
            "",
            settings(&["sh", "-c", "echo 'cannot compile' >&2; exit 1"], "x"),
        );
        app.deploy(&url).await.unwrap();

        let err = app.start().await.unwrap_err();
        assert!(matches!(err, AppError::Build { .. }));
        let snapshot = app.describe().await;
        assert_eq!(snapshot.status, AppStatus::Failed(FailureStage::Build));
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("Build failed: cannot compile")
        );

        // A later successful transition clears the error.
        app.rebuild().await.unwrap();
        let snapshot = app.describe().await;
        assert_eq!(snapshot.status, AppStatus::New);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_process_that_exits_is_start_failure() {
        let (_upstream, url, work) = fixture();
        let app = App::new(
            "demo",
            work.path().join("demo"),
            "",
            settings(
                &["sh", "-c", "printf '#!/bin/sh\\nexit 1\\n' > run.sh && chmod +x run.sh"],
                "run.sh",
            ),
        );
        app.deploy(&url).await.unwrap();

        let err = app.start().await.unwrap_err();
        assert!(matches!(err, AppError::Start(_)));
        let snapshot = app.describe().await;
        assert_eq!(snapshot.status, AppStatus::Failed(FailureStage::Start));
        assert!(snapshot.last_error.unwrap().contains("exited"));
        assert!(snapshot.pid.is_none());
    }

    #[tokio::test]
    async fn test_launch_removes_stale_socket_first() {
        let (_upstream, url, work) = fixture();
        let dir = work.path().join("demo");
        // The artifact refuses to run while a socket file is present.
        let app = App::new(
            "demo",
            &dir,
            "",
            settings(
                &[
                    "sh",
                    "-c",
                    "printf '#!/bin/sh\\n[ -e app.sock ] && exit 7\\nexec sleep 30\\n' > run.sh && chmod +x run.sh",
                ],
                "run.sh",
            ),
        );
        app.deploy(&url).await.unwrap();
        fs::write(dir.join("app.sock"), "").unwrap();

        let err = app.start().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("not ready"), "{}", message);
        assert!(!message.contains("exited"), "{}", message);
        assert!(!dir.join("app.sock").exists());
    }

    #[tokio::test]
    async fn test_stop_when_not_started_reports_status() {
        let work = tempfile::tempdir().unwrap();
        let app = App::new("demo", work.path().join("demo"), "", settings(&["true"], "x"));
        match app.stop().await {
            Err(AppError::NotRunning { status }) => assert_eq!(status, AppStatus::New),
            other => panic!("Expected NotRunning, got {:?}", other),
        }
        // Usage errors leave the record untouched.
        let snapshot = app.describe().await;
        assert_eq!(snapshot.status, AppStatus::New);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_and_streams_require_running_app() {
        let work = tempfile::tempdir().unwrap();
        let app = App::new("demo", work.path().join("demo"), "", settings(&["true"], "x"));

        let req = Request::get("/demo/greeting").body(Body::empty()).unwrap();
        assert!(matches!(
            app.dispatch(req).await,
            Err(AppError::NotRunning { .. })
        ));
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            app.stream_stdout(tx).await,
            Err(AppError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_removes_directory_and_blocks_start() {
        let (_upstream, url, work) = fixture();
        let dir = work.path().join("demo");
        let app = App::new("demo", &dir, "", settings(&["true"], "x"));
        app.deploy(&url).await.unwrap();

        app.purge().await.unwrap();
        assert!(!dir.exists());
        assert_eq!(app.status().await, AppStatus::Deleted);
        assert!(matches!(
            app.start().await,
            Err(AppError::InvalidTransition { action: "start", .. })
        ));
    }

    #[tokio::test]
    async fn test_reattach_recovers_metadata() {
        let (_upstream, url, work) = fixture();
        let dir = work.path().join("demo");
        App::new("demo", &dir, "", settings(&["true"], "x"))
            .deploy(&url)
            .await
            .unwrap();

        let recovered = App::new("demo", &dir, "", settings(&["true"], "x"));
        recovered.reattach().await.unwrap();
        let snapshot = recovered.describe().await;
        assert_eq!(snapshot.git_url, url);
        assert_eq!(snapshot.commit.unwrap().message, "first release");
    }

    #[tokio::test]
    async fn test_reattach_without_repository_is_gitlog_failure() {
        let work = tempfile::tempdir().unwrap();
        let dir = work.path().join("broken");
        fs::create_dir_all(&dir).unwrap();
        let app = App::new("broken", &dir, "", settings(&["true"], "x"));

        let err = app.reattach().await.unwrap_err();
        assert!(matches!(err, AppError::GitLog(_)));
        assert_eq!(app.status().await, AppStatus::Failed(FailureStage::GitLog));
    }
}
