//! Claiming work units for agents.
//!
//! A claim gives a work unit its own workspace on a branch named after it,
//! marks it in progress in the tracker and keeps a heartbeat in the
//! workspace while the agent runs. Aborting undoes all of that.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::Config;
use crate::coordination::dispatch::EventDispatcher;
use crate::coordination::events::{ENV_PREFIX, Event, EventKind};
use crate::error::{Error, Result};
use crate::git::Git;
use crate::liveness::health::workspace_root;
use crate::liveness::heartbeat::{HeartbeatHandle, HeartbeatWriter};
use crate::tracker::{Issue, WorkTracker};

/// A claimed work unit with a live heartbeat.
#[derive(Debug)]
pub struct ClaimedWork {
    pub issue_id: String,
    pub issue_title: String,
    pub workspace: PathBuf,
    /// The workspace was created by this claim rather than reused.
    pub created: bool,
    heartbeat: HeartbeatHandle,
}

impl ClaimedWork {
    /// Stop the heartbeat. The tracker claim is kept.
    pub async fn release(self) -> Result<()> {
        self.heartbeat.stop().await
    }
}

/// What an agent run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub issue_id: String,
    pub workspace: PathBuf,
    pub exit_code: i32,
    /// The work unit went back to the open pool because the agent failed.
    pub unclaimed: bool,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What `abort` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbortReport {
    pub issue_id: String,
    pub workspace: PathBuf,
    pub unclaimed: bool,
    pub worktree_removed: bool,
    pub branch_deleted: bool,
}

/// Claims, runs and aborts work units of one repository.
pub struct AgentRunner<T> {
    git: Git,
    tracker: T,
    dispatcher: EventDispatcher,
    main_repo: PathBuf,
    workspace_root: PathBuf,
    heartbeat_interval: Duration,
}

impl<T: WorkTracker> AgentRunner<T> {
    pub fn new(config: &Config, main_repo: &Path, tracker: T) -> Self {
        Self {
            git: Git::new(main_repo),
            tracker,
            dispatcher: EventDispatcher::from_config(config),
            main_repo: main_repo.to_path_buf(),
            workspace_root: workspace_root(&config.worktree.base_path, main_repo),
            heartbeat_interval: Duration::from_secs(config.heartbeat.interval),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn workspace_for(&self, issue_id: &str) -> PathBuf {
        self.workspace_root.join(issue_id)
    }

    /// Prepare the workspace, claim `issue_id` and start its heartbeat.
    ///
    /// A workspace created here is removed again when the tracker refuses
    /// the claim.
    pub async fn claim(&self, issue_id: &str) -> Result<ClaimedWork> {
        let workspace = self.workspace_for(issue_id);
        let issue = self.tracker.show(issue_id).await;

        let created = !workspace.is_dir();
        if created {
            log::info!("Creating workspace {} on branch {}", workspace.display(), issue_id);
            self.git.add_worktree(&workspace, issue_id).await?;
            let event = self.event(EventKind::AgentSpawned, issue_id, issue.as_ref(), &workspace);
            self.dispatcher.dispatch(&event).await;
        } else {
            log::info!("Reusing workspace {}", workspace.display());
        }

        if !self.tracker.claim(issue_id).await {
            if created && let Err(e) = self.git.discard_worktree(&workspace).await {
                log::warn!("Could not remove workspace {}: {}", workspace.display(), e);
            }
            return Err(Error::Tracker {
                command: format!("claim {}", issue_id),
                message: "tracker refused the claim".to_string(),
            });
        }
        let event = self.event(EventKind::TaskClaimed, issue_id, issue.as_ref(), &workspace);
        self.dispatcher.dispatch(&event).await;

        let heartbeat = HeartbeatWriter::new(&workspace, self.heartbeat_interval).start().await?;
        Ok(ClaimedWork {
            issue_id: issue_id.to_string(),
            issue_title: issue.map(|i| i.title).unwrap_or_default(),
            workspace,
            created,
            heartbeat,
        })
    }

    /// Claim `issue_id` and run `program` in its workspace until it exits.
    ///
    /// A nonzero exit puts the work unit back in the open pool; success
    /// keeps the claim for `finish`.
    pub async fn run(&self, issue_id: &str, program: &str, args: &[String]) -> Result<RunReport> {
        let claimed = self.claim(issue_id).await?;
        let workspace = claimed.workspace.clone();

        log::info!("Running {} in {}", program, workspace.display());
        let status = Command::new(program)
            .args(args)
            .current_dir(&workspace)
            .env(format!("{ENV_PREFIX}ISSUE_ID"), issue_id)
            .env(format!("{ENV_PREFIX}WORKTREE"), &workspace)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await;

        if let Err(e) = claimed.release().await {
            log::warn!("Heartbeat for {} did not stop cleanly: {}", issue_id, e);
        }

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                log::error!("Failed to start {}: {}", program, e);
                self.tracker.unclaim(issue_id).await;
                return Err(e.into());
            }
        };

        let issue = self.tracker.show(issue_id).await;
        let event = self
            .event(EventKind::AgentFinished, issue_id, issue.as_ref(), &workspace)
            .with_extra("exit_code", exit_code.to_string());
        self.dispatcher.dispatch(&event).await;

        let unclaimed = exit_code != 0 && self.tracker.unclaim(issue_id).await;
        if exit_code != 0 {
            log::warn!("Agent for {} exited with {}", issue_id, exit_code);
        }

        Ok(RunReport {
            issue_id: issue_id.to_string(),
            workspace,
            exit_code,
            unclaimed,
        })
    }

    /// Give `issue_id` back to the open pool and discard its workspace and branch.
    ///
    /// Each step runs even when an earlier one fails.
    pub async fn abort(&self, issue_id: &str) -> Result<AbortReport> {
        let workspace = self.workspace_for(issue_id);
        let mut report = AbortReport {
            issue_id: issue_id.to_string(),
            workspace: workspace.clone(),
            ..Default::default()
        };

        report.unclaimed = self.tracker.unclaim(issue_id).await;
        if !report.unclaimed {
            log::warn!("Could not reopen {} in the tracker", issue_id);
        }

        if workspace.exists() {
            report.worktree_removed = match self.git.discard_worktree(&workspace).await {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Could not remove workspace {}: {}", workspace.display(), e);
                    false
                }
            };
        }

        if self.git.branch_exists(issue_id).await? {
            report.branch_deleted = match self.git.delete_branch(issue_id).await {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Could not delete branch {}: {}", issue_id, e);
                    false
                }
            };
        }

        Ok(report)
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
