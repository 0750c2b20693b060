//! Work tracker access.
//!
//! Work units (issues) live in an external tracker driven through its CLI
//! (`bd` by default). Every call is bounded by a timeout, and any failure
//! reads as "unknown" rather than an error so the health loop keeps going.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use crate::config::TrackerSettings;
use crate::error::{Error, Result};

pub const STATUS_OPEN: &str = "open";
pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_CLOSED: &str = "closed";

/// A work unit as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub issue_type: Option<String>,
}

impl Issue {
    pub fn is_in_progress(&self) -> bool {
        self.status == STATUS_IN_PROGRESS
    }

    pub fn is_closed(&self) -> bool {
        self.status == STATUS_CLOSED
    }
}

/// Completion state of an epic, from `bd epic status --json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EpicStatus {
    pub epic: EpicRef,
    #[serde(default)]
    pub eligible_for_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EpicRef {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Operations the coordination layer needs from a tracker.
#[async_trait]
pub trait WorkTracker: Send + Sync {
    /// Look up one work unit. `None` when unknown or unreachable.
    async fn show(&self, id: &str) -> Option<Issue>;

    /// All work units currently in progress. Empty when unreachable.
    async fn list_in_progress(&self) -> Vec<Issue>;

    /// Set status and, when given, assignee (empty clears it).
    async fn update(&self, id: &str, status: &str, assignee: Option<&str>) -> bool;

    async fn close(&self, id: &str) -> bool;

    /// Mark a work unit in progress and assigned to the caller.
    async fn claim(&self, id: &str) -> bool {
        self.update(id, STATUS_IN_PROGRESS, None).await
    }

    /// Put a work unit back in the open pool with no assignee.
    async fn unclaim(&self, id: &str) -> bool {
        self.update(id, STATUS_OPEN, Some("")).await
    }

    /// Epic completion states. Empty when the tracker has no epics.
    async fn epic_status(&self) -> Vec<EpicStatus> {
        Vec::new()
    }
}

/// Tracker driven through the `bd` command line.
#[derive(Debug, Clone)]
pub struct BeadsTracker {
    command: String,
    timeout: Duration,
    cwd: Option<PathBuf>,
}

impl BeadsTracker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(10),
            cwd: None,
        }
    }

    pub fn from_settings(settings: &TrackerSettings) -> Self {
        Self::new(settings.command.clone()).with_timeout(Duration::from_secs(settings.timeout))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run tracker commands from `dir` (the tracker finds its database from there).
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let command = format!("{} {}", self.command, args.join(" "));
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Tracker {
                command: command.clone(),
                message: format!("timed out after {:?}", self.timeout),
            })?
            .map_err(|e| Error::Tracker {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::Tracker {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WorkTracker for BeadsTracker {
    async fn show(&self, id: &str) -> Option<Issue> {
        let stdout = self
            .run(&["show", id, "--json"])
            .await
            .map_err(|e| log::warn!("{}", e))
            .ok()?;
        match parse_issues(&stdout) {
            Ok(issues) => issues.into_iter().next(),
            Err(e) => {
                log::warn!("Unexpected tracker output for {}: {}", id, e);
                None
            }
        }
    }

    async fn list_in_progress(&self) -> Vec<Issue> {
        let stdout = match self.run(&["list", "--status", STATUS_IN_PROGRESS, "--json"]).await {
            Ok(stdout) => stdout,
            Err(e) => {
                log::warn!("{}", e);
                return Vec::new();
            }
        };
        parse_issues(&stdout).unwrap_or_else(|e| {
            log::warn!("Unexpected tracker list output: {}", e);
            Vec::new()
        })
    }

    async fn update(&self, id: &str, status: &str, assignee: Option<&str>) -> bool {
        let mut args = vec!["update", id, "--status", status];
        if let Some(assignee) = assignee {
            args.extend(["--assignee", assignee]);
        }
        self.run(&args).await.map_err(|e| log::warn!("{}", e)).is_ok()
    }

    async fn close(&self, id: &str) -> bool {
        self.run(&["close", id]).await.map_err(|e| log::warn!("{}", e)).is_ok()
    }

    async fn claim(&self, id: &str) -> bool {
        self.run(&["update", id, "--claim"]).await.map_err(|e| log::warn!("{}", e)).is_ok()
    }

    async fn epic_status(&self) -> Vec<EpicStatus> {
        let stdout = match self.run(&["epic", "status", "--json"]).await {
            Ok(stdout) => stdout,
            Err(e) => {
                log::debug!("{}", e);
                return Vec::new();
            }
        };
        if stdout.trim().is_empty() {
            return Vec::new();
        }
        serde_json::from_str::<Option<Vec<EpicStatus>>>(&stdout)
            .map(Option::unwrap_or_default)
            .unwrap_or_else(|e| {
                log::warn!("Unexpected epic status output: {}", e);
                Vec::new()
            })
    }
}

/// Epics eligible for closing in `after` that were not eligible in `before`.
pub fn newly_closable(before: &[EpicStatus], after: &[EpicStatus]) -> Vec<EpicRef> {
    after
        .iter()
        .filter(|e| e.eligible_for_close)
        .filter(|e| !before.iter().any(|b| b.eligible_for_close && b.epic.id == e.epic.id))
        .map(|e| e.epic.clone())
        .collect()
}

/// Parse tracker JSON: a single object, an array of objects, or nothing.
pub fn parse_issues(json: &str) -> Result<Vec<Issue>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(json)?;
    let issues = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<Issue>, _>>()?,
        Value::Null => Vec::new(),
        other => vec![serde_json::from_value(other)?],
    };
    Ok(issues)
}
