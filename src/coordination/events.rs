//! Lifecycle events dispatched to plugins.
//!
//! An [`Event`] is an immutable record of one occurrence. Plugins receive it
//! as a set of `CONVOY_*` environment variables built by [`Event::to_env`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Prefix for every environment variable handed to a plugin.
pub const ENV_PREFIX: &str = "CONVOY_";

/// Kinds of events that can be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// An agent was spawned in a fresh workspace.
    #[serde(rename = "agent.spawned")]
    AgentSpawned,
    /// An agent session ended.
    #[serde(rename = "agent.finished")]
    AgentFinished,
    /// A work branch was merged into the integration branch.
    #[serde(rename = "branch.merged")]
    BranchMerged,
    /// A work unit was claimed.
    #[serde(rename = "task.claimed")]
    TaskClaimed,
    /// A work unit was closed.
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// The health checker found a zombie work unit.
    #[serde(rename = "health.zombie")]
    HealthZombie,

    // Tool use events
    /// A tool call succeeded.
    #[serde(rename = "tool.used")]
    ToolUsed,
    /// A tool call failed.
    #[serde(rename = "tool.failed")]
    ToolFailed,

    // Session events
    /// An agent session started.
    #[serde(rename = "session.started")]
    SessionStarted,
    /// A file was read during a session.
    #[serde(rename = "session.file_read")]
    SessionFileRead,
    /// A file was written during a session.
    #[serde(rename = "session.file_written")]
    SessionFileWritten,
}

impl EventKind {
    /// Every event kind, in declaration order.
    pub const ALL: [EventKind; 11] = [
        EventKind::AgentSpawned,
        EventKind::AgentFinished,
        EventKind::BranchMerged,
        EventKind::TaskClaimed,
        EventKind::TaskCompleted,
        EventKind::HealthZombie,
        EventKind::ToolUsed,
        EventKind::ToolFailed,
        EventKind::SessionStarted,
        EventKind::SessionFileRead,
        EventKind::SessionFileWritten,
    ];

    /// Wire name used in configuration and in `CONVOY_EVENT`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentSpawned => "agent.spawned",
            EventKind::AgentFinished => "agent.finished",
            EventKind::BranchMerged => "branch.merged",
            EventKind::TaskClaimed => "task.claimed",
            EventKind::TaskCompleted => "task.completed",
            EventKind::HealthZombie => "health.zombie",
            EventKind::ToolUsed => "tool.used",
            EventKind::ToolFailed => "tool.failed",
            EventKind::SessionStarted => "session.started",
            EventKind::SessionFileRead => "session.file_read",
            EventKind::SessionFileWritten => "session.file_written",
        }
    }

    /// Comma-separated list of valid wire names, for error messages.
    pub fn valid_names() -> String {
        let mut names: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names.join(", ")
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::UnknownEvent { name: s.to_string() })
    }
}

/// An event in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: String,
    /// Kind of event.
    pub kind: EventKind,
    /// Work unit the event concerns.
    pub issue_id: Option<String>,
    /// Work unit title.
    pub issue_title: Option<String>,
    /// Work unit type (task, bug, ...).
    pub issue_type: Option<String>,
    /// Branch name.
    pub branch: Option<String>,
    /// Workspace path.
    pub worktree: Option<PathBuf>,
    /// Main repository path.
    pub main_repo: Option<PathBuf>,
    /// Tracker database path.
    pub beads_db: Option<PathBuf>,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Event-specific values, exported as `CONVOY_<KEY>`.
    pub extra: BTreeMap<String, String>,
}

impl Event {
    /// Create a new event.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kind,
            issue_id: None,
            issue_title: None,
            issue_type: None,
            branch: None,
            worktree: None,
            main_repo: None,
            beads_db: None,
            timestamp: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    /// Set the work unit.
    pub fn for_issue(mut self, issue_id: impl Into<String>) -> Self {
        self.issue_id = Some(issue_id.into());
        self
    }

    /// Set the work unit title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.issue_title = Some(title.into());
        self
    }

    /// Set the work unit type.
    pub fn with_issue_type(mut self, issue_type: impl Into<String>) -> Self {
        self.issue_type = Some(issue_type.into());
        self
    }

    /// Set the branch.
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Set the workspace path.
    pub fn in_worktree(mut self, path: impl AsRef<Path>) -> Self {
        self.worktree = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the main repository path.
    pub fn with_main_repo(mut self, path: impl AsRef<Path>) -> Self {
        self.main_repo = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the tracker database path.
    pub fn with_beads_db(mut self, path: impl AsRef<Path>) -> Self {
        self.beads_db = Some(path.as_ref().to_path_buf());
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add one extra value.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Merge the top-level fields of a JSON object into the extra map.
    ///
    /// Nested objects and arrays are kept as compact JSON text so they still
    /// fit in a single environment variable. Non-object payloads are ignored.
    pub fn with_data(mut self, data: &Value) -> Self {
        if let Value::Object(map) = data {
            for (key, value) in map {
                let flat = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                self.extra.insert(key.clone(), flat);
            }
        }
        self
    }

    /// Environment variables for plugin execution.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(format!("{ENV_PREFIX}EVENT"), self.kind.as_str().to_string());
        env.insert(
            format!("{ENV_PREFIX}TIMESTAMP"),
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        );

        let strings = [
            ("ISSUE_ID", &self.issue_id),
            ("ISSUE_TITLE", &self.issue_title),
            ("ISSUE_TYPE", &self.issue_type),
            ("BRANCH", &self.branch),
        ];
        for (key, value) in strings {
            if let Some(v) = value
                && !v.is_empty()
            {
                env.insert(format!("{ENV_PREFIX}{key}"), v.clone());
            }
        }

        let paths = [
            ("WORKTREE", &self.worktree),
            ("MAIN_REPO", &self.main_repo),
            ("BEADS_DB", &self.beads_db),
        ];
        for (key, value) in paths {
            if let Some(p) = value {
                env.insert(format!("{ENV_PREFIX}{key}"), absolute_display(p));
            }
        }

        for (key, value) in &self.extra {
            env.insert(format!("{ENV_PREFIX}{}", key.to_uppercase()), value.clone());
        }

        env
    }
}

fn absolute_display(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

/// A tool invocation observed in an agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    /// Name of the tool (Read, Edit, Bash, ...).
    pub tool_name: String,
    /// Session identifier.
    pub session_id: String,
    /// When the tool ran.
    pub timestamp: DateTime<Utc>,
    /// Associated work unit, when running inside a workspace.
    pub issue_id: Option<String>,
    /// Workspace path.
    pub worktree: Option<PathBuf>,
    /// Tool execution time.
    pub duration_ms: Option<u64>,
    /// Error message when the tool failed.
    pub error: Option<String>,
}

impl ToolEvent {
    /// Convert to a dispatchable event (`tool.failed` when `failed`).
    pub fn into_event(self, failed: bool) -> Event {
        let kind = if failed { EventKind::ToolFailed } else { EventKind::ToolUsed };
        let mut event = Event::new(kind)
            .at(self.timestamp)
            .with_extra("tool_name", self.tool_name)
            .with_extra("session_id", self.session_id);
        if let Some(ms) = self.duration_ms {
            event = event.with_extra("duration_ms", ms.to_string());
        }
        if let Some(error) = self.error
            && !error.is_empty()
        {
            event = event.with_extra("error", error);
        }
        event.issue_id = self.issue_id;
        event.worktree = self.worktree;
        event
    }
}

/// Session lifecycle and file activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Session identifier.
    pub session_id: String,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Associated work unit.
    pub issue_id: Option<String>,
    /// Workspace path.
    pub worktree: Option<PathBuf>,
    /// File touched, for file events.
    pub file_path: Option<PathBuf>,
    /// Lines read, for `session.file_read`.
    pub lines: Option<u64>,
    /// Whether the operation succeeded.
    pub success: bool,
}

impl SessionEvent {
    /// Convert to a dispatchable event of the given session kind.
    pub fn into_event(self, kind: EventKind) -> Event {
        let mut event = Event::new(kind)
            .at(self.timestamp)
            .with_extra("session_id", self.session_id);
        if let Some(path) = &self.file_path {
            event = event.with_extra("file_path", path.to_string_lossy());
        }
        if let Some(lines) = self.lines {
            event = event.with_extra("lines", lines.to_string());
        }
        event = event.with_extra("success", self.success.to_string());
        event.issue_id = self.issue_id;
        event.worktree = self.worktree;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!(matches!(
            "agent.exploded".parse::<EventKind>(),
            Err(Error::UnknownEvent { .. })
        ));
    }

    #[test]
    fn test_kind_serde_uses_wire_name() {
        let json = serde_json::to_string(&EventKind::SessionFileRead).unwrap();
        assert_eq!(json, "\"session.file_read\"");
    }

    #[test]
    fn test_event_builder() {
        let event = Event::new(EventKind::TaskClaimed)
            .for_issue("bd-42")
            .with_title("Fix parser")
            .on_branch("bd-42")
            .with_extra("agent", "claude");

        assert_eq!(event.issue_id.as_deref(), Some("bd-42"));
        assert_eq!(event.issue_title.as_deref(), Some("Fix parser"));
        assert_eq!(event.extra["agent"], "claude");
    }

    #[test]
    fn test_to_env() {
        let event = Event::new(EventKind::AgentSpawned)
            .for_issue("bd-1")
            .with_issue_type("bug")
            .in_worktree("/tmp/wt/bd-1")
            .with_extra("session_id", "abc");

        let env = event.to_env();
        assert_eq!(env["CONVOY_EVENT"], "agent.spawned");
        assert_eq!(env["CONVOY_ISSUE_ID"], "bd-1");
        assert_eq!(env["CONVOY_ISSUE_TYPE"], "bug");
        assert_eq!(env["CONVOY_WORKTREE"], "/tmp/wt/bd-1");
        assert_eq!(env["CONVOY_SESSION_ID"], "abc");
        assert!(env.contains_key("CONVOY_TIMESTAMP"));
        assert!(!env.contains_key("CONVOY_ISSUE_TITLE"));
        assert!(!env.contains_key("CONVOY_MAIN_REPO"));
    }

    #[test]
    fn test_with_data_flattens_nested_values() {
        let data = serde_json::json!({
            "tool_name": "Edit",
            "lines": 12,
            "tool_input": {"file_path": "src/lib.rs"},
        });
        let env = Event::new(EventKind::ToolUsed).with_data(&data).to_env();

        assert_eq!(env["CONVOY_TOOL_NAME"], "Edit");
        assert_eq!(env["CONVOY_LINES"], "12");
        assert_eq!(env["CONVOY_TOOL_INPUT"], r#"{"file_path":"src/lib.rs"}"#);
    }

    #[test]
    fn test_tool_event_conversion() {
        let tool = ToolEvent {
            tool_name: "Bash".to_string(),
            session_id: "s-1".to_string(),
            timestamp: Utc::now(),
            issue_id: Some("bd-7".to_string()),
            worktree: None,
            duration_ms: Some(250),
            error: Some("exit 1".to_string()),
        };

        let event = tool.into_event(true);
        assert_eq!(event.kind, EventKind::ToolFailed);
        assert_eq!(event.issue_id.as_deref(), Some("bd-7"));
        assert_eq!(event.extra["duration_ms"], "250");
        assert_eq!(event.extra["error"], "exit 1");
    }

    #[test]
    fn test_session_event_conversion() {
        let session = SessionEvent {
            session_id: "s-2".to_string(),
            timestamp: Utc::now(),
            issue_id: None,
            worktree: None,
            file_path: Some(PathBuf::from("README.md")),
            lines: Some(40),
            success: false,
        };

        let event = session.into_event(EventKind::SessionFileRead);
        assert_eq!(event.kind, EventKind::SessionFileRead);
        assert_eq!(event.extra["file_path"], "README.md");
        assert_eq!(event.extra["lines"], "40");
        assert_eq!(event.extra["success"], "false");
    }
}
