//! Configuration for convoy.
//!
//! Read from `.convoy/config.yml`, searched from the current directory
//! upward. Every section has defaults, so a missing file is not an error.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::coordination::EventKind;

/// Directory holding the config file and local state.
pub const CONFIG_DIR: &str = ".convoy";
/// Config file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.yml";

/// Convoy configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Background scheduler and health check settings.
    pub daemon: DaemonSettings,
    /// Workspace layout.
    pub worktree: WorktreeSettings,
    /// Task tracker CLI.
    pub tracker: TrackerSettings,
    /// Merge lock timing.
    pub lock: LockSettings,
    /// Heartbeat writer.
    pub heartbeat: HeartbeatSettings,
    /// Plugin subscriptions, in dispatch order.
    pub plugins: Vec<PluginConfig>,
    /// Where this config was loaded from.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        match Self::find_config(&cwd) {
            Some(path) => Self::load_from_file(&path).context(format!("Failed to load config from {}", path.display())),
            None => {
                log::info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Search `start` and its ancestors for `.convoy/config.yml`.
    pub fn find_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    pub(crate) fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let mut config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        config.config_path = Some(path.as_ref().to_path_buf());

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Check plugin definitions.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.name.as_str()) {
                return Err(crate::Error::Config(format!("duplicate plugin name '{}'", plugin.name)));
            }
            plugin.validate()?;
        }
        Ok(())
    }

    /// Enabled plugins subscribed to `kind`, in declared order.
    pub fn plugins_for(&self, kind: EventKind) -> Vec<&PluginConfig> {
        self.plugins
            .iter()
            .filter(|p| p.enabled && p.matches(kind))
            .collect()
    }

    /// Look up a value by dot-separated path (e.g. `daemon.zombie_threshold`).
    pub fn get_value(&self, key_path: &str) -> crate::Result<serde_yaml::Value> {
        let mut current = serde_yaml::to_value(self)?;
        for part in key_path.split('.') {
            let next = match &current {
                serde_yaml::Value::Mapping(map) => map.get(part).cloned(),
                serde_yaml::Value::Sequence(items) => items
                    .iter()
                    .find(|item| item.get("name").and_then(|n| n.as_str()) == Some(part))
                    .cloned(),
                _ => None,
            };
            current = next.ok_or_else(|| crate::Error::Config(format!("invalid config path: {}", key_path)))?;
        }
        Ok(current)
    }

    /// Directory for the PID marker, daemon log and dispatch log.
    ///
    /// The `.convoy` directory holding the loaded config when there is one,
    /// otherwise the per-user data directory.
    pub fn state_dir(&self) -> PathBuf {
        self.config_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("convoy")
            })
    }

    /// Get the PID file path.
    pub fn pid_path(&self) -> PathBuf {
        self.state_dir().join("daemon.pid")
    }

    /// Get the daemon log path.
    pub fn daemon_log_path(&self) -> PathBuf {
        self.state_dir().join("daemon.log")
    }

    /// Get the plugin dispatch log path.
    pub fn events_log_path(&self) -> PathBuf {
        self.state_dir().join("events.log")
    }

    /// Convert to DaemonConfig.
    pub fn to_daemon_config(&self) -> crate::daemon::DaemonConfig {
        crate::daemon::DaemonConfig {
            pid_path: self.pid_path(),
            log_path: self.daemon_log_path(),
            health_interval: self.daemon.health_interval(),
        }
    }
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Seconds between health checks.
    pub health_interval: u64,
    /// Seconds without a heartbeat before a work unit counts as a zombie.
    pub zombie_threshold: u64,
    /// Reopen zombie work units automatically.
    pub auto_recover: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            health_interval: 60,
            zombie_threshold: 300,
            auto_recover: false,
        }
    }
}

impl DaemonSettings {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval)
    }

    pub fn zombie_threshold(&self) -> Duration {
        Duration::from_secs(self.zombie_threshold)
    }
}

/// Workspace layout settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorktreeSettings {
    /// Base directory for workspaces; `{repo}` expands to the repo name.
    /// Relative paths are resolved against the main repository root.
    pub base_path: String,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self {
            base_path: "../{repo}-worktrees".to_string(),
        }
    }
}

/// Task tracker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Tracker executable.
    pub command: String,
    /// Per-call timeout in seconds.
    pub timeout: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            command: "bd".to_string(),
            timeout: 10,
        }
    }
}

/// Merge lock settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockSettings {
    /// Seconds to wait for the lock before giving up.
    pub timeout: u64,
    /// Seconds between acquisition attempts.
    pub poll_interval: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: 300,
            poll_interval: 5,
        }
    }
}

/// Heartbeat writer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Seconds between heartbeat writes.
    pub interval: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self { interval: 30 }
    }
}

/// A plugin subscription.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    /// Plugin name, unique within the config.
    pub name: String,
    /// Event names that trigger the plugin. Accepts a string or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub on: Vec<String>,
    /// Shell command to run.
    pub run: String,
    /// Whether dispatch waits for this plugin and stops on its failure.
    #[serde(default)]
    pub blocking: bool,
    /// Timeout in seconds.
    #[serde(default = "default_plugin_timeout")]
    pub timeout: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_plugin_timeout() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

impl PluginConfig {
    /// Whether this plugin subscribes to `kind`.
    pub fn matches(&self, kind: EventKind) -> bool {
        self.on.iter().any(|name| name == kind.as_str())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.run.trim().is_empty() {
            return Err(crate::Error::Config(format!("plugin '{}' has an empty 'run' command", self.name)));
        }
        if self.on.is_empty() {
            return Err(crate::Error::Config(format!("plugin '{}' does not subscribe to any event", self.name)));
        }
        for name in &self.on {
            if name.parse::<EventKind>().is_err() {
                return Err(crate::Error::Config(format!(
                    "plugin '{}' specifies invalid event '{}'. Valid events are: {}",
                    self.name,
                    name,
                    EventKind::valid_names()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}
