//! Finishing a work unit.
//!
//! Merges the work unit's branch into the main branch under the merge lock,
//! then removes its workspace and branch, closes it in the tracker and
//! announces completion to plugins. Epics that closing the work unit
//! completes are closed too.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::coordination::dispatch::EventDispatcher;
use crate::coordination::events::{Event, EventKind};
use crate::coordination::lock::{AcquireOutcome, MergeLock, RefStore};
use crate::error::{Error, Result};
use crate::git::Git;
use crate::liveness::health::workspace_root;
use crate::tracker::{EpicStatus, Issue, WorkTracker, newly_closable};

const REMOTE: &str = "origin";
const MAIN_BRANCH: &str = "main";

/// What `finish` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishReport {
    pub issue_id: String,
    pub issue_title: String,
    pub workspace: PathBuf,
    pub merged: bool,
    pub worktree_removed: bool,
    pub branch_deleted: bool,
    pub issue_closed: bool,
    /// Epics closed because this work unit completed them, as (id, title).
    pub closed_epics: Vec<(String, String)>,
}

/// Runs the finish workflow for work units of one repository.
pub struct Finisher<S, T> {
    git: Git,
    lock: MergeLock<S>,
    tracker: T,
    dispatcher: EventDispatcher,
    main_repo: PathBuf,
    workspace_root: PathBuf,
}

impl<S: RefStore, T: WorkTracker> Finisher<S, T> {
    pub fn new(config: &Config, main_repo: &Path, store: S, tracker: T) -> Self {
        Self {
            git: Git::new(main_repo),
            lock: MergeLock::from_settings(store, &config.lock),
            tracker,
            dispatcher: EventDispatcher::from_config(config),
            main_repo: main_repo.to_path_buf(),
            workspace_root: workspace_root(&config.worktree.base_path, main_repo),
        }
    }

    pub fn with_lock(mut self, lock: MergeLock<S>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn workspace_for(&self, issue_id: &str) -> PathBuf {
        self.workspace_root.join(issue_id)
    }

    /// Report where the workspace lives without touching anything.
    pub async fn locate(&self, issue_id: &str) -> Result<FinishReport> {
        let workspace = self.workspace_for(issue_id);
        if !workspace.is_dir() {
            return Err(Error::WorkspaceNotFound { path: workspace });
        }
        let issue = self.tracker.show(issue_id).await;
        Ok(FinishReport {
            issue_id: issue_id.to_string(),
            issue_title: issue.map(|i| i.title).unwrap_or_default(),
            workspace,
            ..Default::default()
        })
    }

    /// Merge, clean up and close `issue_id`.
    pub async fn finish(&self, issue_id: &str) -> Result<FinishReport> {
        let workspace = self.workspace_for(issue_id);
        if !workspace.is_dir() {
            return Err(Error::WorkspaceNotFound { path: workspace });
        }
        let issue = self.tracker.show(issue_id).await;
        let mut report = FinishReport {
            issue_id: issue_id.to_string(),
            issue_title: issue.as_ref().map(|i| i.title.clone()).unwrap_or_default(),
            workspace: workspace.clone(),
            ..Default::default()
        };

        log::info!("Acquiring merge lock for {}", issue_id);
        if let AcquireOutcome::TimedOut { holder, waited } = self.lock.acquire(issue_id).await {
            return Err(Error::LockTimeout {
                holder: holder.map(|m| m.holder).unwrap_or_else(|| "unknown".to_string()),
                waited_secs: waited.as_secs(),
            });
        }

        let merged = self.merge_locked(issue_id, issue.as_ref(), &workspace).await;
        let release = self.lock.release(Some(issue_id)).await;
        if !release.is_free() {
            log::warn!("Merge lock not released cleanly: {:?}", release);
        }
        report.merged = merged?;

        if let Err(e) = self.git.detach_head(&workspace).await {
            log::warn!("Could not detach HEAD in {}: {}", workspace.display(), e);
        }
        report.worktree_removed = match self.git.remove_worktree(&workspace).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Could not remove workspace {}: {}", workspace.display(), e);
                false
            }
        };

        report.branch_deleted = if self.git.branch_exists(issue_id).await? {
            match self.git.delete_branch(issue_id).await {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Could not delete branch {}: {}", issue_id, e);
                    false
                }
            }
        } else {
            true
        };

        report.issue_closed = match &issue {
            Some(i) if i.is_closed() || i.status == "done" => true,
            _ => {
                let before = self.tracker.epic_status().await;
                let closed = self.tracker.close(issue_id).await;
                if closed {
                    report.closed_epics = self.close_completed_epics(&before).await;
                }
                closed
            }
        };

        let event = self.event(EventKind::TaskCompleted, issue_id, issue.as_ref(), &workspace);
        self.dispatcher.dispatch(&event).await;

        Ok(report)
    }

    /// Steps that run while the merge lock is held.
    async fn merge_locked(&self, issue_id: &str, issue: Option<&Issue>, workspace: &Path) -> Result<bool> {
        self.git.checkout(MAIN_BRANCH).await?;
        self.git.pull_ff_only(REMOTE, MAIN_BRANCH).await?;

        if !self.git.branch_exists(issue_id).await? {
            log::info!("Branch {} does not exist, assuming it was already merged", issue_id);
            return Ok(true);
        }

        log::info!("Merging {} into {}", issue_id, MAIN_BRANCH);
        self.git.merge(issue_id).await?;
        self.git.push(REMOTE, MAIN_BRANCH).await?;

        let event = self.event(EventKind::BranchMerged, issue_id, issue, workspace);
        self.dispatcher.dispatch(&event).await;
        Ok(true)
    }

    async fn close_completed_epics(&self, before: &[EpicStatus]) -> Vec<(String, String)> {
        let after = self.tracker.epic_status().await;
        let mut closed = Vec::new();
        for epic in newly_closable(before, &after) {
            if self.tracker.close(&epic.id).await {
                log::info!("Closed epic {} ({})", epic.id, epic.title);
                closed.push((epic.id, epic.title));
            } else {
                log::warn!("Could not close completed epic {}", epic.id);
            }
        }
        closed
    }

    fn event(&self, kind: EventKind, issue_id: &str, issue: Option<&Issue>, workspace: &Path) -> Event {
        let mut event = Event::new(kind)
            .for_issue(issue_id)
            .on_branch(issue_id)
            .in_worktree(workspace)
            .with_main_repo(&self.main_repo)
            .with_beads_db(self.main_repo.join(".beads"));
        if let Some(issue) = issue {
            event = event.with_title(&issue.title);
            if let Some(issue_type) = &issue.issue_type {
                event = event.with_issue_type(issue_type);
            }
        }
        event
    }
}
