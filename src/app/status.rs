use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::git::CommitInfo;

/// Lifecycle stage whose failure put an app into an error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    Purge,
    GitClone,
    GitLog,
    Build,
    Start,
}

/// Lifecycle state of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppStatus {
    New,
    Started,
    Stopped,
    Deleted,
    Failed(FailureStage),
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::Deleted => "DELETED",
            Self::Failed(FailureStage::Purge) => "ERR:PURGE",
            Self::Failed(FailureStage::GitClone) => "ERR:GITCLONE",
            Self::Failed(FailureStage::GitLog) => "ERR:GITLOG",
            Self::Failed(FailureStage::Build) => "ERR:BUILD",
            Self::Failed(FailureStage::Start) => "ERR:START",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Started)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "STARTED" => Ok(Self::Started),
            "STOPPED" => Ok(Self::Stopped),
            "DELETED" => Ok(Self::Deleted),
            "ERR:PURGE" => Ok(Self::Failed(FailureStage::Purge)),
            "ERR:GITCLONE" => Ok(Self::Failed(FailureStage::GitClone)),
            "ERR:GITLOG" => Ok(Self::Failed(FailureStage::GitLog)),
            "ERR:BUILD" => Ok(Self::Failed(FailureStage::Build)),
            "ERR:START" => Ok(Self::Failed(FailureStage::Start)),
            _ => Err(format!("Invalid app status: {}", s)),
        }
    }
}

impl Serialize for AppStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AppStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Point-in-time view of an app, as reported by the status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSnapshot {
    pub name: String,
    pub git_url: String,
    /// `"<hash> <message> by <author> at <time>"`, empty before the first
    /// successful clone.
    pub git_commit: String,
    pub commit: Option<CommitInfo>,
    pub status: AppStatus,
    pub app_dir: PathBuf,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub exit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
}
