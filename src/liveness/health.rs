//! Zombie detection.
//!
//! A work unit is a zombie when the tracker says it is in progress but
//! nothing is working on it: its workspace is gone, or the workspace shows no
//! sign of life. Liveness comes from the heartbeat record when there is one,
//! and from a working-directory process scan otherwise.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::coordination::dispatch::EventDispatcher;
use crate::coordination::events::{Event, EventKind};
use crate::liveness::heartbeat::HeartbeatRecord;
use crate::liveness::process;
use crate::tracker::{Issue, WorkTracker};

/// Where a liveness verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessSource {
    /// A heartbeat record (fresh or stale).
    Heartbeat,
    /// The process scan, used when no readable record exists.
    Process,
    /// No evidence was gathered (no workspace).
    None,
}

impl std::fmt::Display for LivenessSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Process => write!(f, "process"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Health of one work unit at the time of the check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHealth {
    pub issue_id: String,
    pub status: String,
    pub assignee: Option<String>,
    pub workspace: PathBuf,
    pub workspace_exists: bool,
    pub alive: bool,
    pub source: LivenessSource,
    /// Timestamp of the last heartbeat, when one was read.
    pub last_activity: Option<DateTime<Utc>>,
    pub is_zombie: bool,
}

impl TaskHealth {
    /// Seconds since the last heartbeat.
    pub fn last_seen_secs(&self) -> Option<i64> {
        self.last_activity
            .map(|ts| Utc::now().signed_duration_since(ts).num_seconds().max(0))
    }
}

/// Runs health checks against the tracker and the workspaces on disk.
pub struct HealthChecker<T> {
    tracker: T,
    dispatcher: EventDispatcher,
    main_repo: PathBuf,
    workspace_root: PathBuf,
    zombie_threshold: Duration,
    auto_recover: bool,
}

impl<T: WorkTracker> HealthChecker<T> {
    pub fn new(config: &Config, main_repo: &Path, tracker: T) -> Self {
        Self {
            tracker,
            dispatcher: EventDispatcher::from_config(config),
            main_repo: main_repo.to_path_buf(),
            workspace_root: workspace_root(&config.worktree.base_path, main_repo),
            zombie_threshold: config.daemon.zombie_threshold(),
            auto_recover: config.daemon.auto_recover,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Directory that would hold the workspace for `issue_id`.
    pub fn workspace_for(&self, issue_id: &str) -> PathBuf {
        self.workspace_root.join(issue_id)
    }

    /// Check every in-progress work unit and handle the zombies.
    pub async fn check_all(&self) -> Vec<TaskHealth> {
        let issues = self.tracker.list_in_progress().await;
        log::debug!("Checking health of {} in-progress work unit(s)", issues.len());

        let mut results = Vec::with_capacity(issues.len());
        for issue in issues {
            let health = self.assess(&issue).await;
            if health.is_zombie {
                self.handle_zombie(&health).await;
            }
            results.push(health);
        }
        results
    }

    /// Check one work unit without acting on the result.
    pub async fn check_task(&self, issue_id: &str) -> Option<TaskHealth> {
        let issue = self.tracker.show(issue_id).await?;
        Some(self.assess(&issue).await)
    }

    /// Gather liveness evidence for one work unit.
    pub async fn assess(&self, issue: &Issue) -> TaskHealth {
        let workspace = self.workspace_for(&issue.id);
        let workspace_exists = workspace.is_dir();

        let (alive, source, last_activity) = if !workspace_exists {
            (false, LivenessSource::None, None)
        } else if let Some(record) = HeartbeatRecord::read(&workspace) {
            (
                record.is_fresh(self.zombie_threshold),
                LivenessSource::Heartbeat,
                Some(record.timestamp),
            )
        } else {
            (process::process_in_dir(&workspace).await, LivenessSource::Process, None)
        };

        TaskHealth {
            issue_id: issue.id.clone(),
            status: issue.status.clone(),
            assignee: issue.assignee.clone().filter(|a| !a.is_empty()),
            workspace,
            workspace_exists,
            alive,
            source,
            last_activity,
            is_zombie: issue.is_in_progress() && !alive,
        }
    }

    async fn handle_zombie(&self, health: &TaskHealth) {
        log::warn!(
            "Zombie work unit {} (assignee: {}, workspace exists: {})",
            health.issue_id,
            health.assignee.as_deref().unwrap_or("none"),
            health.workspace_exists
        );

        let mut event = Event::new(EventKind::HealthZombie)
            .for_issue(&health.issue_id)
            .with_main_repo(&self.main_repo)
            .with_extra("worktree_exists", health.workspace_exists.to_string())
            .with_extra("assignee", health.assignee.clone().unwrap_or_default());
        if health.workspace_exists {
            event = event.in_worktree(&health.workspace);
        }
        if let Some(secs) = health.last_seen_secs() {
            event = event.with_extra("last_seen_secs", secs.to_string());
        }
        self.dispatcher.dispatch(&event).await;

        if self.auto_recover {
            if self.tracker.unclaim(&health.issue_id).await {
                log::info!("Reopened zombie work unit {}", health.issue_id);
            } else {
                log::error!("Failed to reopen zombie work unit {}", health.issue_id);
            }
        }
    }
}

/// Expand `{repo}` and resolve a relative base path against the main repo.
pub fn workspace_root(template: &str, main_repo: &Path) -> PathBuf {
    let repo_name = main_repo
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = PathBuf::from(template.replace("{repo}", &repo_name));
    if base.is_absolute() {
        base
    } else {
        normalize(&main_repo.join(base))
    }
}

/// Resolve `.` and `..` lexically.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
