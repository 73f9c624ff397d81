//! Optional resource isolation for app processes.
//!
//! Each started process can be placed in its own control group with a memory
//! ceiling. When isolation is disabled a no-op group is handed out instead, so
//! the lifecycle code never branches on it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A control group a process can be moved into.
pub trait ResourceGroup: Send + Sync {
    fn add(&self, pid: u32) -> io::Result<()>;
    fn delete(&self) -> io::Result<()>;
}

/// Used when isolation is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGroup;

impl ResourceGroup for NoopGroup {
    fn add(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }

    fn delete(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A cgroup v2 directory under the unified hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupV2Group {
    path: PathBuf,
}

impl CgroupV2Group {
    /// Create (or reuse) `<root>/<name>` and apply the memory ceiling.
    pub fn create(root: &Path, name: &str, memory_max: Option<u64>) -> io::Result<Self> {
        let path = root.join(name);
        fs::create_dir_all(&path)?;
        if let Some(limit) = memory_max {
            fs::write(path.join("memory.max"), limit.to_string())?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResourceGroup for CgroupV2Group {
    fn add(&self, pid: u32) -> io::Result<()> {
        fs::write(self.path.join("cgroup.procs"), pid.to_string())
    }

    fn delete(&self) -> io::Result<()> {
        // cgroupfs only allows removing a group once it has no members.
        match fs::remove_dir(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// `[isolation]` section of the runner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub enabled: bool,
    pub cgroup_root: PathBuf,
    pub memory_max: Option<u64>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/apprunner"),
            memory_max: Some(512 * 1024 * 1024),
        }
    }
}

impl IsolationConfig {
    /// Group for the app called `name`.
    pub fn group_for(&self, name: &str) -> io::Result<Box<dyn ResourceGroup>> {
        if !self.enabled {
            return Ok(Box::new(NoopGroup));
        }
        let group = CgroupV2Group::create(&self.cgroup_root, name, self.memory_max)?;
        Ok(Box::new(group))
    }
}
