//! Runner configuration.
//!
//! Settings live in `<working-dir>/apprunner.toml`; every key is optional and
//! a missing file means "all defaults". Command-line flags are applied on top
//! by the binary.
//!
//! ```toml
//! [server]
//! addr = "127.0.0.1:8080"
//!
//! [apps]
//! dir = "apps"
//!
//! [build]
//! command = ["cargo", "build", "--release"]
//! artifact = "target/release/{name}"
//!
//! [runtime]
//! socket_name = "app.sock"
//! socket_flag = "--unix-socket"
//! ready_timeout_ms = 5000
//! ready_poll_ms = 50
//! stop_timeout_ms = 10000
//! subscriber_capacity = 256
//! log_backlog = 1024
//!
//! [git]
//! ssh_key = "/home/deploy/.ssh/id_ed25519"
//!
//! [isolation]
//! enabled = false
//! cgroup_root = "/sys/fs/cgroup/apprunner"
//! memory_max = 536870912
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::isolation::IsolationConfig;

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE: &str = "apprunner.toml";

/// Placeholder expanded to the app name in build settings.
const NAME_PLACEHOLDER: &str = "{name}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsConfig {
    /// Subdirectory of the working directory holding one directory per app.
    pub dir: String,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            dir: "apps".to_string(),
        }
    }
}

/// The fixed build step run in an app directory before every start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Path of the built executable, relative to the app directory.
    pub artifact: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: ["cargo", "build", "--release"]
                .map(String::from)
                .to_vec(),
            artifact: format!("target/release/{}", NAME_PLACEHOLDER),
        }
    }
}

impl BuildConfig {
    /// Build command line with `{name}` expanded.
    pub fn command_for(&self, name: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(NAME_PLACEHOLDER, name))
            .collect()
    }

    /// Executable location for `name`, relative to the app directory.
    pub fn artifact_for(&self, name: &str) -> PathBuf {
        PathBuf::from(self.artifact.replace(NAME_PLACEHOLDER, name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// File name of the unix socket inside the app directory.
    pub socket_name: String,
    /// Flag passed to the executable ahead of the socket path.
    pub socket_flag: String,
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
    pub stop_timeout_ms: u64,
    /// Buffer size of each live log subscriber channel.
    pub subscriber_capacity: usize,
    /// Records kept per log viewer before the oldest are overwritten.
    pub log_backlog: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_name: "app.sock".to_string(),
            socket_flag: "--unix-socket".to_string(),
            ready_timeout_ms: 5_000,
            ready_poll_ms: 50,
            stop_timeout_ms: 10_000,
            subscriber_capacity: 256,
            log_backlog: 1_024,
        }
    }
}

impl RuntimeConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// SSH private key used for ssh remotes. Unset: look in `~/.ssh`, then
    /// fall back to the agent.
    pub ssh_key: Option<PathBuf>,
}

/// Raw TOML structure for `apprunner.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerConfig,
    apps: AppsConfig,
    build: BuildConfig,
    runtime: RuntimeConfig,
    git: GitConfig,
    isolation: IsolationConfig,
}

/// Fully resolved runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub working_dir: PathBuf,
    pub server: ServerConfig,
    pub apps: AppsConfig,
    pub build: BuildConfig,
    pub runtime: RuntimeConfig,
    pub git: GitConfig,
    pub isolation: IsolationConfig,
}

impl RunnerConfig {
    /// Defaults rooted at `working_dir`.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self::from_file(working_dir.into(), ConfigFile::default())
    }

    fn from_file(working_dir: PathBuf, file: ConfigFile) -> Self {
        Self {
            working_dir,
            server: file.server,
            apps: file.apps,
            build: file.build,
            runtime: file.runtime,
            git: file.git,
            isolation: file.isolation,
        }
    }

    /// Load configuration for `working_dir`.
    ///
    /// An explicit `config_path` must exist; otherwise `apprunner.toml` in the
    /// working directory is used when present.
    pub fn load(working_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file {} does not exist", path.display());
                }
                path.to_path_buf()
            }
            None => {
                let default = working_dir.join(CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::new(working_dir));
                }
                default
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let config = Self::from_file(working_dir.to_path_buf(), file);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.build.command.is_empty() {
            bail!("[build] command must name a program");
        }
        if self.build.artifact.is_empty() {
            bail!("[build] artifact must not be empty");
        }
        if self.apps.dir.is_empty() {
            bail!("[apps] dir must not be empty");
        }
        if self.runtime.socket_name.is_empty() {
            bail!("[runtime] socket_name must not be empty");
        }
        if self.runtime.subscriber_capacity == 0 || self.runtime.log_backlog == 0 {
            bail!("[runtime] subscriber_capacity and log_backlog must be positive");
        }
        Ok(())
    }

    /// Effective settings in `apprunner.toml` form.
    pub fn to_toml(&self) -> Result<String> {
        let file = ConfigFile {
            server: self.server.clone(),
            apps: self.apps.clone(),
            build: self.build.clone(),
            runtime: self.runtime.clone(),
            git: self.git.clone(),
            isolation: self.isolation.clone(),
        };
        toml::to_string_pretty(&file).context("Failed to serialize configuration")
    }

    /// Root directory holding every app directory.
    pub fn apps_root(&self) -> PathBuf {
        self.working_dir.join(&self.apps.dir)
    }
}
