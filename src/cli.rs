//! CLI argument parsing for convoy.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::LazyLock;

/// Generate the after-help text with tool versions.
fn generate_after_help() -> String {
    let mut lines = Vec::new();

    lines.push("\x1b[1mRequired Tools:\x1b[0m".to_string());
    for (tool, prefix) in [("git", "git version "), ("bd", "bd version ")] {
        let status = match std::process::Command::new(tool).arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                let version = version.trim().replace(prefix, "");
                format!("  ✅ {:<10} {}", tool, version)
            }
            _ => format!("  ❌ {:<10} not installed", tool),
        };
        lines.push(status);
    }

    lines.push(String::new());
    lines.push("Logs are written to: ~/.local/share/convoy/logs/convoy.log".to_string());

    lines.join("\n")
}

static AFTER_HELP: LazyLock<String> = LazyLock::new(generate_after_help);

#[derive(Parser)]
#[command(
    name = "convoy",
    about = "Coordination layer for parallel coding agents",
    version,
    after_help = AFTER_HELP.as_str()
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Daemon lifecycle commands.
#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the health-check daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,

        /// Restart: stop daemon first if already running
        #[arg(short, long)]
        restart: bool,
    },

    /// Stop the daemon
    Stop,

    /// Check daemon status
    Status,
}

/// Merge lock commands.
#[derive(Subcommand)]
pub enum LockCommand {
    /// Show who holds the merge lock
    Status,

    /// Release the merge lock
    Release {
        /// Only release if held by this holder
        #[arg(long)]
        holder: Option<String>,
    },
}

/// Event commands.
#[derive(Subcommand)]
pub enum EventsCommand {
    /// Emit an event to subscribed plugins
    Emit {
        /// Event name (e.g. task.completed)
        event: String,

        /// Work unit id
        #[arg(long)]
        issue: Option<String>,

        /// Work unit title
        #[arg(long)]
        title: Option<String>,

        /// Branch name
        #[arg(long)]
        branch: Option<String>,

        /// Workspace path
        #[arg(long)]
        worktree: Option<PathBuf>,

        /// Main repository path
        #[arg(long)]
        main_repo: Option<PathBuf>,

        /// Tracker database path
        #[arg(long)]
        beads_db: Option<PathBuf>,

        /// JSON object whose keys become extra variables
        #[arg(long)]
        data: Option<String>,

        /// Extra variable as KEY=VALUE (repeatable)
        #[arg(long, value_parser = parse_key_value)]
        extra: Vec<(String, String)>,
    },

    /// Emit tool.used / tool.failed from a JSON tool record on stdin
    Tool {
        /// Emit tool.failed instead of tool.used
        #[arg(long)]
        failed: bool,
    },

    /// Emit a session.* event from a JSON session record on stdin
    Session {
        /// Event name (session.started, session.file_read, session.file_written)
        event: String,
    },

    /// List the event names plugins can subscribe to
    List,
}

/// Configuration commands.
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration and print a summary
    Validate,

    /// Print one value by dot-separated path
    Get {
        /// Key path, e.g. daemon.zombie_threshold
        key: String,
    },
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage the health-check daemon
    #[command(subcommand)]
    Daemon(DaemonCommand),

    /// Inspect or release the merge lock
    #[command(subcommand)]
    Lock(LockCommand),

    /// Emit events
    #[command(subcommand)]
    Events(EventsCommand),

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Check work unit health once
    Health {
        /// Check only this work unit
        issue: Option<String>,
    },

    /// Keep a workspace's heartbeat fresh until interrupted
    Heartbeat {
        /// Workspace path
        workspace: PathBuf,

        /// Seconds between heartbeats
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Merge a finished work unit and clean up its workspace
    Finish {
        /// Work unit id (also the branch name)
        issue: String,

        /// Only report where the workspace is
        #[arg(long)]
        no_merge: bool,
    },

    /// Claim a work unit and keep its heartbeat until interrupted
    Claim {
        /// Work unit id (also the branch name)
        issue: String,
    },

    /// Claim a work unit and run an agent command in its workspace
    Run {
        /// Work unit id (also the branch name)
        issue: String,

        /// Agent command and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Give a work unit back and discard its workspace and branch
    Abort {
        /// Work unit id (also the branch name)
        issue: String,
    },

    /// List workspaces with their heartbeat state
    #[command(alias = "ls")]
    Worktrees,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}
