//! End-to-end finish workflow against a bare remote.
//!
//! Every test skips when git is not installed.

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{Remote, git};
use convoy::config::{Config, PluginConfig};
use convoy::coordination::dispatch::{DispatchLog, EventDispatcher};
use convoy::coordination::lock::{MergeLock, ReleaseOutcome};
use convoy::error::Error;
use convoy::finish::Finisher;
use convoy::git::GitRefStore;
use convoy::tracker::{EpicRef, EpicStatus, Issue, WorkTracker};

struct FakeTracker {
    issue: Issue,
    closed: Arc<Mutex<Vec<String>>>,
    /// Epic that becomes closable once `issue` is closed.
    epic: Option<EpicRef>,
}

impl FakeTracker {
    fn new(id: &str, status: &str) -> Self {
        Self {
            issue: Issue {
                id: id.to_string(),
                title: "Add feature".to_string(),
                status: status.to_string(),
                assignee: Some("agent-1".to_string()),
                issue_type: Some("task".to_string()),
            },
            closed: Arc::default(),
            epic: None,
        }
    }

    fn in_epic(mut self, id: &str, title: &str) -> Self {
        self.epic = Some(EpicRef {
            id: id.to_string(),
            title: title.to_string(),
        });
        self
    }
}

#[async_trait]
impl WorkTracker for FakeTracker {
    async fn show(&self, id: &str) -> Option<Issue> {
        (id == self.issue.id).then(|| self.issue.clone())
    }

    async fn list_in_progress(&self) -> Vec<Issue> {
        Vec::new()
    }

    async fn update(&self, _id: &str, _status: &str, _assignee: Option<&str>) -> bool {
        true
    }

    async fn close(&self, id: &str) -> bool {
        self.closed.lock().unwrap().push(id.to_string());
        true
    }

    async fn epic_status(&self) -> Vec<EpicStatus> {
        let done = self.closed.lock().unwrap().contains(&self.issue.id);
        self.epic
            .iter()
            .map(|epic| EpicStatus {
                epic: epic.clone(),
                eligible_for_close: done,
            })
            .collect()
    }
}

struct Project {
    remote: Remote,
    main: PathBuf,
    events: PathBuf,
}

impl Project {
    /// Seeded main checkout at `<tmp>/app` plus a workspace for `issue` with one commit.
    fn with_workspace(issue: &str) -> Option<Self> {
        let remote = Remote::new()?;
        let main = remote.seeded_clone("app")?;
        let workspace = remote.temp.path().join("app-worktrees").join(issue);
        git(&main, &["worktree", "add", "-q", workspace.to_str()?, "-b", issue])?;
        std::fs::write(workspace.join("feature.txt"), "feature\n").ok()?;
        git(&workspace, &["add", "."])?;
        git(&workspace, &["commit", "-q", "-m", "Add feature"])?;

        let events = remote.temp.path().join("events.txt");
        Some(Self { remote, main, events })
    }

    fn workspace(&self, issue: &str) -> PathBuf {
        self.remote.temp.path().join("app-worktrees").join(issue)
    }

    fn finisher(&self, tracker: FakeTracker) -> Finisher<GitRefStore, FakeTracker> {
        let config = Config::default();
        let recorder = PluginConfig {
            name: "recorder".to_string(),
            on: vec!["branch.merged".to_string(), "task.completed".to_string()],
            run: format!("echo \"$CONVOY_EVENT $CONVOY_ISSUE_ID\" >> {}", self.events.display()),
            blocking: true,
            timeout: 10,
            enabled: true,
        };
        let dispatcher = EventDispatcher::new(
            vec![recorder],
            DispatchLog::new(self.remote.temp.path().join("events.log")),
        );
        Finisher::new(&config, &self.main, GitRefStore::new(&self.main), tracker)
            .with_lock(lock(&self.main, Duration::from_secs(2)))
            .with_dispatcher(dispatcher)
    }

    fn recorded_events(&self) -> String {
        std::fs::read_to_string(&self.events).unwrap_or_default()
    }
}

fn lock(repo: &Path, timeout: Duration) -> MergeLock<GitRefStore> {
    MergeLock::new(GitRefStore::new(repo))
        .with_timeout(timeout)
        .with_poll_interval(Duration::from_millis(100))
}

#[tokio::test]
async fn test_finish_merges_and_cleans_up() {
    let Some(project) = Project::with_workspace("bd-1") else { return };
    let finisher = project.finisher(FakeTracker::new("bd-1", "in_progress"));

    let report = finisher.finish("bd-1").await.unwrap();

    assert!(report.merged);
    assert!(report.worktree_removed);
    assert!(report.branch_deleted);
    assert!(report.issue_closed);
    assert_eq!(report.issue_title, "Add feature");

    assert_eq!(project.remote.show_main("feature.txt").as_deref(), Some("feature"));
    assert!(!project.workspace("bd-1").exists());
    assert!(git(&project.main, &["show-ref", "--verify", "--quiet", "refs/heads/bd-1"]).is_none());
    assert!(!lock(&project.main, Duration::ZERO).status().await.held);
    assert_eq!(project.recorded_events(), "branch.merged bd-1\ntask.completed bd-1\n");
}

#[tokio::test]
async fn test_finish_skips_close_for_closed_issue() {
    let Some(project) = Project::with_workspace("bd-2") else { return };
    let tracker = FakeTracker::new("bd-2", "closed");
    let finisher = project.finisher(tracker);

    let report = finisher.finish("bd-2").await.unwrap();
    assert!(report.issue_closed);
    assert!(project.recorded_events().contains("task.completed bd-2"));
}

#[tokio::test]
async fn test_finish_without_workspace() {
    let Some(project) = Project::with_workspace("bd-3") else { return };
    let finisher = project.finisher(FakeTracker::new("bd-404", "in_progress"));

    let err = finisher.finish("bd-404").await.unwrap_err();
    assert!(matches!(err, Error::WorkspaceNotFound { .. }));
    assert!(finisher.locate("bd-404").await.is_err());
}

#[tokio::test]
async fn test_locate_reports_workspace_only() {
    let Some(project) = Project::with_workspace("bd-4") else { return };
    let finisher = project.finisher(FakeTracker::new("bd-4", "in_progress"));

    let report = finisher.locate("bd-4").await.unwrap();
    assert_eq!(report.workspace, project.workspace("bd-4"));
    assert!(!report.merged);
    assert!(project.workspace("bd-4").exists());
    assert_eq!(project.recorded_events(), "");
}

#[tokio::test]
async fn test_finish_waits_out_foreign_lock() {
    let Some(project) = Project::with_workspace("bd-5") else { return };
    let other = lock(&project.main, Duration::ZERO);
    assert!(other.acquire("bd-other").await.is_acquired());

    let finisher = project.finisher(FakeTracker::new("bd-5", "in_progress"));
    let err = finisher.finish("bd-5").await.unwrap_err();

    match err {
        Error::LockTimeout { holder, .. } => assert_eq!(holder, "bd-other"),
        other => panic!("expected lock timeout, got {:?}", other),
    }
    assert!(project.remote.show_main("feature.txt").is_none());
    assert!(project.workspace("bd-5").exists());
    assert_eq!(other.status().await.holder(), Some("bd-other"));
    assert_eq!(other.release(Some("bd-other")).await, ReleaseOutcome::Released);
}

#[tokio::test]
async fn test_failed_merge_releases_lock() {
    let Some(project) = Project::with_workspace("bd-6") else { return };

    // Conflicting change to the same file on both sides.
    let workspace = project.workspace("bd-6");
    std::fs::write(workspace.join("README.md"), "# from branch\n").unwrap();
    git(&workspace, &["commit", "-q", "-am", "Edit readme on branch"]).unwrap();
    let Some(other) = project.remote.clone_as("other") else { return };
    std::fs::write(other.join("README.md"), "# from main\n").unwrap();
    git(&other, &["commit", "-q", "-am", "Edit readme on main"]).unwrap();
    git(&other, &["push", "-q", "origin", "main"]).unwrap();

    let finisher = project.finisher(FakeTracker::new("bd-6", "in_progress"));
    let err = finisher.finish("bd-6").await.unwrap_err();

    assert!(matches!(err, Error::Git { .. }));
    assert!(!lock(&project.main, Duration::ZERO).status().await.held);
    assert!(workspace.exists());
    assert_eq!(project.recorded_events(), "");
}

#[tokio::test]
async fn test_finish_closes_completed_epic() {
    let Some(project) = Project::with_workspace("bd-7") else { return };
    let tracker = FakeTracker::new("bd-7", "in_progress").in_epic("bd-epic", "Checkout");
    let closed = Arc::clone(&tracker.closed);
    let finisher = project.finisher(tracker);

    let report = finisher.finish("bd-7").await.unwrap();

    assert_eq!(report.closed_epics, vec![("bd-epic".to_string(), "Checkout".to_string())]);
    assert_eq!(*closed.lock().unwrap(), vec!["bd-7".to_string(), "bd-epic".to_string()]);
}

#[tokio::test]
async fn test_finish_leaves_epics_alone_without_close() {
    let Some(project) = Project::with_workspace("bd-8") else { return };
    let tracker = FakeTracker::new("bd-8", "closed").in_epic("bd-epic", "Checkout");
    let closed = Arc::clone(&tracker.closed);
    let finisher = project.finisher(tracker);

    let report = finisher.finish("bd-8").await.unwrap();

    assert!(report.closed_epics.is_empty());
    assert!(closed.lock().unwrap().is_empty());
}
