//! Claiming, running and aborting work units against a real repository.
//!
//! Every test skips when git is not installed.

mod common;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{Remote, git};
use convoy::agent::AgentRunner;
use convoy::config::{Config, PluginConfig};
use convoy::coordination::dispatch::{DispatchLog, EventDispatcher};
use convoy::error::Error;
use convoy::liveness::{HeartbeatRecord, heartbeat_path};
use convoy::tracker::{Issue, WorkTracker};

/// Records every status change as `id status assignee`.
#[derive(Clone, Default)]
struct FakeTracker {
    updates: Arc<Mutex<Vec<String>>>,
    refuse_claims: bool,
}

impl FakeTracker {
    fn updates(&self) -> Vec<String> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkTracker for FakeTracker {
    async fn show(&self, id: &str) -> Option<Issue> {
        Some(Issue {
            id: id.to_string(),
            title: "Add feature".to_string(),
            status: "open".to_string(),
            assignee: None,
            issue_type: Some("task".to_string()),
        })
    }

    async fn list_in_progress(&self) -> Vec<Issue> {
        Vec::new()
    }

    async fn update(&self, id: &str, status: &str, assignee: Option<&str>) -> bool {
        if self.refuse_claims && status == "in_progress" {
            return false;
        }
        let line = format!("{} {} {}", id, status, assignee.unwrap_or("-"));
        self.updates.lock().unwrap().push(line.trim_end().to_string());
        true
    }

    async fn close(&self, _id: &str) -> bool {
        true
    }
}

struct Project {
    remote: Remote,
    main: PathBuf,
    events: PathBuf,
}

impl Project {
    fn new() -> Option<Self> {
        let remote = Remote::new()?;
        let main = remote.seeded_clone("app")?;
        let events = remote.temp.path().join("events.txt");
        Some(Self { remote, main, events })
    }

    fn workspace(&self, issue: &str) -> PathBuf {
        self.remote.temp.path().join("app-worktrees").join(issue)
    }

    fn runner(&self, tracker: FakeTracker) -> AgentRunner<FakeTracker> {
        let recorder = PluginConfig {
            name: "recorder".to_string(),
            on: vec![
                "agent.spawned".to_string(),
                "task.claimed".to_string(),
                "agent.finished".to_string(),
            ],
            run: format!(
                "echo \"$CONVOY_EVENT $CONVOY_ISSUE_ID${{CONVOY_EXIT_CODE:+ $CONVOY_EXIT_CODE}}\" >> {}",
                self.events.display()
            ),
            blocking: true,
            timeout: 10,
            enabled: true,
        };
        let dispatcher = EventDispatcher::new(
            vec![recorder],
            DispatchLog::new(self.remote.temp.path().join("events.log")),
        );
        AgentRunner::new(&Config::default(), &self.main, tracker)
            .with_dispatcher(dispatcher)
            .with_heartbeat_interval(Duration::from_millis(50))
    }

    fn recorded_events(&self) -> String {
        std::fs::read_to_string(&self.events).unwrap_or_default()
    }

    fn has_branch(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{}", branch);
        git(&self.main, &["show-ref", "--verify", "--quiet", &reference]).is_some()
    }
}

#[tokio::test]
async fn test_claim_then_abort() {
    let Some(project) = Project::new() else { return };
    let tracker = FakeTracker::default();
    let runner = project.runner(tracker.clone());

    let claimed = runner.claim("bd-1").await.unwrap();
    let workspace = project.workspace("bd-1");
    assert!(claimed.created);
    assert_eq!(claimed.workspace, workspace);
    assert_eq!(claimed.issue_title, "Add feature");
    assert!(workspace.join("README.md").exists());
    assert!(project.has_branch("bd-1"));
    assert_eq!(HeartbeatRecord::read(&workspace).unwrap().pid, std::process::id());
    assert_eq!(tracker.updates(), vec!["bd-1 in_progress -"]);
    assert_eq!(project.recorded_events(), "agent.spawned bd-1\ntask.claimed bd-1\n");

    claimed.release().await.unwrap();
    assert!(!heartbeat_path(&workspace).exists());

    let report = runner.abort("bd-1").await.unwrap();
    assert!(report.unclaimed);
    assert!(report.worktree_removed);
    assert!(report.branch_deleted);
    assert!(!workspace.exists());
    assert!(!project.has_branch("bd-1"));
    assert_eq!(tracker.updates(), vec!["bd-1 in_progress -", "bd-1 open"]);
}

#[tokio::test]
async fn test_claim_reuses_existing_workspace() {
    let Some(project) = Project::new() else { return };
    let workspace = project.workspace("bd-2");
    git(&project.main, &["worktree", "add", "-q", workspace.to_str().unwrap(), "-b", "bd-2"]).unwrap();
    std::fs::write(workspace.join("notes.txt"), "wip\n").unwrap();

    let runner = project.runner(FakeTracker::default());
    let claimed = runner.claim("bd-2").await.unwrap();

    assert!(!claimed.created);
    assert!(workspace.join("notes.txt").exists());
    assert_eq!(project.recorded_events(), "task.claimed bd-2\n");
    claimed.release().await.unwrap();
}

#[tokio::test]
async fn test_refused_claim_removes_new_workspace() {
    let Some(project) = Project::new() else { return };
    let tracker = FakeTracker {
        refuse_claims: true,
        ..Default::default()
    };
    let runner = project.runner(tracker);

    let err = runner.claim("bd-3").await.unwrap_err();

    assert!(matches!(err, Error::Tracker { .. }));
    assert!(!project.workspace("bd-3").exists());
    assert_eq!(project.recorded_events(), "agent.spawned bd-3\n");
}

#[tokio::test]
async fn test_successful_run_keeps_claim() {
    let Some(project) = Project::new() else { return };
    let tracker = FakeTracker::default();
    let runner = project.runner(tracker.clone());

    // The agent sees its own workspace with a live heartbeat.
    let script = "test -f .convoy/heartbeat && test \"$CONVOY_ISSUE_ID\" = bd-4".to_string();
    let report = runner.run("bd-4", "sh", &["-c".to_string(), script]).await.unwrap();

    assert!(report.success());
    assert!(!report.unclaimed);
    assert!(project.workspace("bd-4").exists());
    assert!(!heartbeat_path(&project.workspace("bd-4")).exists());
    assert_eq!(tracker.updates(), vec!["bd-4 in_progress -"]);
    assert_eq!(
        project.recorded_events(),
        "agent.spawned bd-4\ntask.claimed bd-4\nagent.finished bd-4 0\n"
    );
}

#[tokio::test]
async fn test_failed_run_unclaims() {
    let Some(project) = Project::new() else { return };
    let tracker = FakeTracker::default();
    let runner = project.runner(tracker.clone());

    let report = runner
        .run("bd-5", "sh", &["-c".to_string(), "exit 3".to_string()])
        .await
        .unwrap();

    assert_eq!(report.exit_code, 3);
    assert!(report.unclaimed);
    assert!(project.workspace("bd-5").exists());
    assert_eq!(tracker.updates(), vec!["bd-5 in_progress -", "bd-5 open"]);
    assert!(project.recorded_events().ends_with("agent.finished bd-5 3\n"));
}

#[tokio::test]
async fn test_abort_without_workspace() {
    let Some(project) = Project::new() else { return };
    let tracker = FakeTracker::default();
    let runner = project.runner(tracker.clone());

    let report = runner.abort("bd-9").await.unwrap();

    assert!(report.unclaimed);
    assert!(!report.worktree_removed);
    assert!(!report.branch_deleted);
    assert_eq!(tracker.updates(), vec!["bd-9 open"]);
}
