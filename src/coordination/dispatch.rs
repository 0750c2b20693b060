//! Plugin dispatch.
//!
//! Plugins are shell commands subscribed to event kinds. Blocking plugins run
//! one after another and the first failure stops the rest; non-blocking
//! plugins are spawned onto the runtime and only report through the
//! dispatch log. Short-lived hosts call [`EventDispatcher::drain`] before
//! their runtime shuts down so background plugins get to finish.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::task::TaskTracker;

use crate::config::{Config, PluginConfig};
use crate::coordination::events::Event;

/// Output recorded for plugins that were spawned and not awaited.
pub const ASYNC_PLACEHOLDER: &str = "(async execution started)";

/// Outcome of running one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginResult {
    /// Plugin name.
    pub plugin: String,
    pub success: bool,
    /// Exit code, absent when the process never exited normally.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub output: Option<String>,
    /// Captured stderr or the reason the plugin could not run.
    pub error: Option<String>,
    pub duration: Duration,
}

impl PluginResult {
    fn failed(plugin: &str, error: String, duration: Duration) -> Self {
        Self {
            plugin: plugin.to_string(),
            success: false,
            exit_code: None,
            output: None,
            error: Some(error),
            duration,
        }
    }

    fn placeholder(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            success: true,
            exit_code: None,
            output: Some(ASYNC_PLACEHOLDER.to_string()),
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// Whether this result stands in for a plugin still running in the background.
    pub fn is_placeholder(&self) -> bool {
        self.output.as_deref() == Some(ASYNC_PLACEHOLDER) && self.duration.is_zero()
    }

    /// One entry of the dispatch log.
    pub fn log_line(&self) -> String {
        let status = if self.success { "SUCCESS" } else { "FAILED" };
        let mut line = format!(
            "[{}] [{}] Plugin '{}': ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            status,
            self.plugin
        );
        if let Some(code) = self.exit_code {
            line.push_str(&format!("exit_code={} ", code));
        }
        line.push_str(&format!("duration={}ms\n", self.duration.as_millis()));
        if let Some(error) = &self.error {
            line.push_str(&format!("  Error: {}\n", error));
        }
        line
    }
}

/// Append-only record of plugin outcomes.
#[derive(Debug, Clone)]
pub struct DispatchLog {
    path: PathBuf,
}

impl DispatchLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a result. Failures are logged and otherwise ignored.
    pub async fn record(&self, result: &PluginResult) {
        if let Err(e) = self.append(&result.log_line()).await {
            log::warn!("Failed to write dispatch log {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// Routes events to subscribed plugins.
///
/// Clones share the set of background plugin tasks.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    plugins: Vec<PluginConfig>,
    log: DispatchLog,
    background: TaskTracker,
}

impl EventDispatcher {
    pub fn new(plugins: Vec<PluginConfig>, log: DispatchLog) -> Self {
        Self {
            plugins,
            log,
            background: TaskTracker::new(),
        }
    }

    /// Dispatcher for the configured plugins, logging to the state directory.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.plugins.clone(), DispatchLog::new(config.events_log_path()))
    }

    pub fn log(&self) -> &DispatchLog {
        &self.log
    }

    /// Enabled plugins subscribed to the event, in declared order.
    pub fn subscribers(&self, event: &Event) -> Vec<&PluginConfig> {
        self.plugins
            .iter()
            .filter(|p| p.enabled && p.matches(event.kind))
            .collect()
    }

    /// Run every plugin subscribed to `event`.
    ///
    /// Results for non-blocking plugins are placeholders. The first failing
    /// blocking plugin ends the dispatch.
    pub async fn dispatch(&self, event: &Event) -> Vec<PluginResult> {
        let subscribers = self.subscribers(event);
        if subscribers.is_empty() {
            log::debug!("No plugins subscribed to {}", event.kind);
            return Vec::new();
        }
        log::info!("Dispatching {} to {} plugin(s)", event.kind, subscribers.len());

        let mut results = Vec::with_capacity(subscribers.len());
        for plugin in subscribers {
            if plugin.blocking {
                let result = run_plugin(plugin, event, &self.log).await;
                let failed = !result.success;
                results.push(result);
                if failed {
                    log::warn!("Blocking plugin '{}' failed, skipping remaining plugins", plugin.name);
                    break;
                }
            } else {
                results.push(PluginResult::placeholder(&plugin.name));
                let plugin = plugin.clone();
                let event = event.clone();
                let log = self.log.clone();
                // Not awaited here: the outcome only reaches the dispatch log.
                drop(self.background.spawn(async move {
                    run_plugin(&plugin, &event, &log).await;
                }));
            }
        }

        results
    }

    /// Number of background plugins still running.
    pub fn pending(&self) -> usize {
        self.background.len()
    }

    /// Wait for every background plugin spawned so far to finish and log.
    pub async fn drain(&self) {
        if self.background.is_empty() {
            return;
        }
        log::debug!("Waiting for {} background plugin(s)", self.background.len());
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }
}

/// Run one plugin to completion or timeout, then record it.
async fn run_plugin(plugin: &PluginConfig, event: &Event, log: &DispatchLog) -> PluginResult {
    let result = execute(plugin, event).await;
    if result.success {
        log::debug!("Plugin '{}' succeeded in {:?}", plugin.name, result.duration);
    } else {
        log::warn!(
            "Plugin '{}' failed: {}",
            plugin.name,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    log.record(&result).await;
    result
}

async fn execute(plugin: &PluginConfig, event: &Event) -> PluginResult {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&plugin.run)
        .envs(event.to_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir(event) {
        cmd.current_dir(dir);
    }

    let start = Instant::now();
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return PluginResult::failed(&plugin.name, format!("failed to start plugin: {}", e), start.elapsed());
        }
    };

    // Dropping the output future on timeout kills the child.
    let output = tokio::time::timeout(plugin.timeout(), child.wait_with_output()).await;
    let duration = start.elapsed();

    match output {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let success = output.status.success();
            let error = match (success, stderr.is_empty()) {
                (true, _) => None,
                (false, true) => Some(format!("plugin {}", output.status)),
                (false, false) => Some(stderr),
            };
            PluginResult {
                plugin: plugin.name.clone(),
                success,
                exit_code: output.status.code(),
                output: (!stdout.is_empty()).then_some(stdout),
                error,
                duration,
            }
        }
        Ok(Err(e)) => PluginResult::failed(&plugin.name, format!("failed to wait for plugin: {}", e), duration),
        Err(_) => PluginResult::failed(
            &plugin.name,
            format!("plugin timed out after {}s", plugin.timeout),
            duration,
        ),
    }
}

/// Workspace when it exists, otherwise the main repository when it exists.
fn working_dir(event: &Event) -> Option<&Path> {
    [&event.worktree, &event.main_repo]
        .into_iter()
        .flatten()
        .map(PathBuf::as_path)
        .find(|p| p.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::events::EventKind;
    use tempfile::TempDir;

    fn plugin(name: &str, run: &str, blocking: bool) -> PluginConfig {
        PluginConfig {
            name: name.to_string(),
            on: vec!["task.completed".to_string()],
            run: run.to_string(),
            blocking,
            timeout: 5,
            enabled: true,
        }
    }

    fn dispatcher(temp: &TempDir, plugins: Vec<PluginConfig>) -> EventDispatcher {
        EventDispatcher::new(plugins, DispatchLog::new(temp.path().join("events.log")))
    }

    #[test]
    fn test_subscribers_filter_and_order() {
        let temp = TempDir::new().unwrap();
        let mut disabled = plugin("disabled", "true", true);
        disabled.enabled = false;
        let mut other = plugin("other", "true", true);
        other.on = vec!["branch.merged".to_string()];
        let dispatcher = dispatcher(
            &temp,
            vec![plugin("b", "true", true), disabled, other, plugin("a", "true", false)],
        );

        let event = Event::new(EventKind::TaskCompleted);
        let names: Vec<_> = dispatcher.subscribers(&event).iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp, vec![plugin("a", "true", true)]);
        let results = dispatcher.dispatch(&Event::new(EventKind::AgentSpawned)).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_success_captures_output() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp, vec![plugin("echo", "echo \"$CONVOY_ISSUE_ID\"", true)]);

        let event = Event::new(EventKind::TaskCompleted).for_issue("bd-7");
        let results = dispatcher.dispatch(&event).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].exit_code, Some(0));
        assert_eq!(results[0].output.as_deref(), Some("bd-7"));
        assert_eq!(results[0].error, None);
    }

    #[tokio::test]
    async fn test_blocking_failure_stops_dispatch() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("ran");
        let dispatcher = dispatcher(
            &temp,
            vec![
                plugin("first", "echo boom >&2; exit 3", true),
                plugin("second", &format!("touch {}", marker.display()), true),
            ],
        );

        let results = dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;

        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].exit_code, Some(3));
        assert_eq!(results[0].error.as_deref(), Some("boom"));
        assert!(!marker.exists());

        let log = std::fs::read_to_string(dispatcher.log().path()).unwrap();
        assert!(log.contains("[FAILED] Plugin 'first': exit_code=3"));
        assert!(log.contains("  Error: boom"));
    }

    #[tokio::test]
    async fn test_blocking_timeout() {
        let temp = TempDir::new().unwrap();
        let mut slow = plugin("slow", "sleep 10", true);
        slow.timeout = 1;
        let dispatcher = dispatcher(&temp, vec![slow]);

        let start = Instant::now();
        let results = dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!results[0].success);
        assert_eq!(results[0].exit_code, None);
        assert_eq!(results[0].error.as_deref(), Some("plugin timed out after 1s"));

        let log = std::fs::read_to_string(dispatcher.log().path()).unwrap();
        assert!(log.contains("[FAILED] Plugin 'slow': duration="));
    }

    #[tokio::test]
    async fn test_non_blocking_returns_placeholder() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp, vec![plugin("bg", "sleep 1; exit 1", false)]);

        let start = Instant::now();
        let results = dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;

        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(results[0].is_placeholder());
        assert_eq!(results[0].output.as_deref(), Some(ASYNC_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_non_blocking_result_reaches_log() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp, vec![plugin("bg", "exit 2", false)]);
        dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;

        let path = dispatcher.log().path().to_path_buf();
        for _ in 0..50 {
            if let Ok(log) = std::fs::read_to_string(&path)
                && log.contains("Plugin 'bg'")
            {
                assert!(log.contains("[FAILED] Plugin 'bg': exit_code=2"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("background plugin never logged");
    }

    #[tokio::test]
    async fn test_drain_waits_for_background_plugins() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("done");
        let dispatcher = dispatcher(
            &temp,
            vec![plugin("bg", &format!("sleep 0.3; touch {}", marker.display()), false)],
        );

        let results = dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;
        assert!(results[0].is_placeholder());
        assert_eq!(dispatcher.pending(), 1);

        dispatcher.drain().await;
        assert_eq!(dispatcher.pending(), 0);
        assert!(marker.exists());
        let log = std::fs::read_to_string(dispatcher.log().path()).unwrap();
        assert!(log.contains("[SUCCESS] Plugin 'bg': exit_code=0"));

        // Still usable after a drain.
        dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;
        dispatcher.drain().await;
    }

    #[test]
    fn test_drained_plugin_survives_runtime_shutdown() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("done");
        let dispatcher = dispatcher(
            &temp,
            vec![plugin("bg", &format!("sleep 0.3; touch {}", marker.display()), false)],
        );

        let rt = tokio::runtime::Runtime::new().unwrap();
        let results = rt.block_on(async {
            let results = dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;
            dispatcher.drain().await;
            results
        });
        drop(rt);

        assert!(results[0].is_placeholder());
        assert!(marker.exists());
        assert!(dispatcher.log().path().exists());
    }

    #[tokio::test]
    async fn test_non_blocking_failure_does_not_stop_blocking() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(
            &temp,
            vec![plugin("bg", "exit 1", false), plugin("fg", "echo ok", true)],
        );

        let results = dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_placeholder());
        assert_eq!(results[1].output.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_plugin_runs_in_worktree() {
        let temp = TempDir::new().unwrap();
        let worktree = temp.path().join("wt");
        std::fs::create_dir_all(&worktree).unwrap();
        let dispatcher = dispatcher(&temp, vec![plugin("pwd", "pwd", true)]);

        let event = Event::new(EventKind::TaskCompleted)
            .in_worktree(&worktree)
            .with_main_repo(temp.path().join("missing"));
        let results = dispatcher.dispatch(&event).await;

        let cwd = PathBuf::from(results[0].output.as_deref().unwrap());
        assert_eq!(cwd.canonicalize().unwrap(), worktree.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_log_write_failure_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        // A directory where the log file should be makes every append fail.
        let log_path = temp.path().join("events.log");
        std::fs::create_dir_all(&log_path).unwrap();
        let dispatcher = EventDispatcher::new(vec![plugin("ok", "true", true)], DispatchLog::new(log_path));

        let results = dispatcher.dispatch(&Event::new(EventKind::TaskCompleted)).await;
        assert!(results[0].success);
    }

    #[test]
    fn test_log_line_format() {
        let result = PluginResult {
            plugin: "notify".to_string(),
            success: true,
            exit_code: Some(0),
            output: None,
            error: None,
            duration: Duration::from_millis(42),
        };
        let line = result.log_line();
        assert!(line.ends_with("[SUCCESS] Plugin 'notify': exit_code=0 duration=42ms\n"));
        assert!(!line.contains("Error:"));
    }
}
