//! Convoy CLI entry point.

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use fork::{Fork, daemon};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;

mod cli;

use cli::{Cli, Command, ConfigCommand, DaemonCommand, EventsCommand, LockCommand};
use convoy::agent::{AbortReport, AgentRunner};
use convoy::config::Config;
use convoy::coordination::{
    Event, EventDispatcher, EventKind, LockStatus, MergeLock, ReleaseOutcome, SessionEvent, ToolEvent,
};
use convoy::daemon::{Daemon, DaemonConfig, StopOutcome, is_daemon_running, redirect_stdio, running_pid, stop_daemon};
use convoy::finish::{FinishReport, Finisher};
use convoy::git::{Git, GitRefStore};
use convoy::liveness::heartbeat::wait_for_signal;
use convoy::liveness::{HealthChecker, HeartbeatRecord, HeartbeatWriter, TaskHealth};
use convoy::tracker::BeadsTracker;

fn log_filter(verbose: bool) -> env_logger::Env<'static> {
    env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" })
}

fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("convoy")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("convoy.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(log_filter(verbose))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn main() -> Result<()> {
    // Parse CLI args first (before any async runtime)
    let cli = Cli::parse();

    if let Command::Daemon(DaemonCommand::Start {
        foreground: false,
        restart,
    }) = &cli.command
    {
        // Daemonize BEFORE starting tokio runtime
        let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
        let daemon_config = config.to_daemon_config();

        if is_daemon_running(&daemon_config) {
            if !restart {
                eprintln!("{} Daemon is already running", "!".yellow());
                return Ok(());
            }
            // Short-lived runtime, dropped before the fork.
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            rt.block_on(stop_daemon(&daemon_config))?;
        }

        return daemonize(config, cli.verbose);
    }

    // For all other commands, run with tokio
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", config.config_path);

    match cli.command {
        Command::Daemon(cmd) => handle_daemon_command(&config, cmd).await,
        Command::Lock(cmd) => handle_lock_command(&config, cmd).await,
        Command::Events(cmd) => handle_events_command(&config, cmd).await,
        Command::Config(cmd) => handle_config_command(&config, cmd),
        Command::Health { issue } => run_health(&config, issue.as_deref()).await,
        Command::Heartbeat { workspace, interval } => {
            let interval = Duration::from_secs(interval.unwrap_or(config.heartbeat.interval));
            let writer = HeartbeatWriter::new(&workspace, interval);
            println!("{} Heartbeat for {} every {:?}", "→".blue(), workspace.display(), interval);
            writer.run_until_signal().await?;
            Ok(())
        }
        Command::Finish { issue, no_merge } => run_finish(&config, &issue, no_merge).await,
        Command::Claim { issue } => run_claim(&config, &issue).await,
        Command::Run { issue, command } => run_agent(&config, &issue, &command).await,
        Command::Abort { issue } => run_abort(&config, &issue).await,
        Command::Worktrees => list_worktrees(&config).await,
    }
}

fn daemonize(config: Config, verbose: bool) -> Result<()> {
    // The tokio runtime can't survive a fork, so it is created in the child.
    // The working directory is kept so the repository can still be found.
    match daemon(true, true) {
        Ok(Fork::Child) => {
            let daemon_config = config.to_daemon_config();
            redirect_stdio(&daemon_config.log_path)?;

            env_logger::Builder::from_env(log_filter(verbose))
                .target(env_logger::Target::Stderr)
                .init();

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_daemon(&config, daemon_config))
        }
        Ok(Fork::Parent(_)) => {
            println!("{} Daemon started in background", "✓".green());
            std::process::exit(0);
        }
        Err(e) => Err(eyre::eyre!("Failed to daemonize: {:?}", e)),
    }
}

async fn run_daemon(config: &Config, daemon_config: DaemonConfig) -> Result<()> {
    let main_repo = main_repo().await?;
    let checker = HealthChecker::new(config, &main_repo, tracker(config, &main_repo));
    let daemon = Daemon::new(daemon_config, checker);
    daemon.run().await?;
    Ok(())
}

async fn handle_daemon_command(config: &Config, cmd: DaemonCommand) -> Result<()> {
    let daemon_config = config.to_daemon_config();

    match cmd {
        DaemonCommand::Start { restart, .. } => {
            if is_daemon_running(&daemon_config) {
                if !restart {
                    eprintln!("{} Daemon is already running", "!".yellow());
                    return Ok(());
                }
                stop_daemon(&daemon_config).await?;
            }
            println!("{} Starting daemon in foreground...", "→".blue());
            run_daemon(config, daemon_config).await
        }
        DaemonCommand::Stop => {
            match stop_daemon(&daemon_config).await? {
                StopOutcome::NotRunning => println!("{} Daemon is not running", "○".yellow()),
                StopOutcome::Stopped { pid } => println!("{} Daemon stopped (pid {})", "✓".green(), pid),
                StopOutcome::Killed { pid } => {
                    println!("{} Daemon killed after ignoring SIGTERM (pid {})", "!".yellow(), pid)
                }
            }
            Ok(())
        }
        DaemonCommand::Status => {
            match running_pid(&daemon_config) {
                Some(pid) => {
                    println!("{} Daemon is running (pid {})", "✓".green(), pid);
                    println!("  Log: {}", daemon_config.log_path.display());
                }
                None => {
                    println!("{} Daemon is not running", "○".yellow());
                    println!("Start with: {}", "convoy daemon start".cyan());
                }
            }
            Ok(())
        }
    }
}

async fn handle_lock_command(config: &Config, cmd: LockCommand) -> Result<()> {
    // Any checkout sharing the remote sees the same lock.
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let repo = Git::repo_root(&cwd).await.context("Not in a git repository")?;
    let lock = MergeLock::from_settings(GitRefStore::new(repo), &config.lock);

    match cmd {
        LockCommand::Status => {
            print_lock_status(&lock.status().await);
            Ok(())
        }
        LockCommand::Release { holder } => {
            let outcome = match holder.as_deref() {
                Some(holder) => lock.release(Some(holder)).await,
                None => {
                    println!("{} Force-releasing merge lock...", "→".blue());
                    lock.force_release().await
                }
            };
            match outcome {
                ReleaseOutcome::Released => println!("{} Lock released", "✓".green()),
                ReleaseOutcome::AlreadyFree => println!("{} Lock was not held", "○".yellow()),
                ReleaseOutcome::NotHolder { holder: current } => {
                    eprintln!(
                        "{} Lock is held by {}, not releasing",
                        "✗".red(),
                        current.as_deref().unwrap_or("an unknown holder")
                    );
                    std::process::exit(1);
                }
                ReleaseOutcome::Failed { error } => {
                    eprintln!("{} Failed to release lock: {}", "✗".red(), error);
                    std::process::exit(1);
                }
            }
            Ok(())
        }
    }
}

fn print_lock_status(status: &LockStatus) {
    if !status.held {
        println!("{} Lock: {}", "○".green(), "FREE".green());
        return;
    }
    println!("{} Lock: {}", "●".red(), "HELD".red());
    match &status.metadata {
        Some(m) => {
            println!("  Holder:   {}", m.holder.cyan());
            println!("  Acquired: {} ({}s ago)", m.acquired_at.to_rfc3339(), m.held_for().num_seconds());
            println!("  Host:     {}", m.host);
            println!("  PID:      {}", m.pid);
        }
        None => println!("  {}", "(lock metadata unreadable)".dimmed()),
    }
}

async fn handle_events_command(config: &Config, cmd: EventsCommand) -> Result<()> {
    match cmd {
        EventsCommand::List => {
            for kind in EventKind::ALL {
                let count = config.plugins_for(kind).len();
                println!("{:<22} {} plugin(s)", kind.as_str().cyan(), count);
            }
            Ok(())
        }
        EventsCommand::Emit {
            event,
            issue,
            title,
            branch,
            worktree,
            main_repo,
            beads_db,
            data,
            extra,
        } => {
            let kind: EventKind = event.parse()?;
            let mut event = Event::new(kind);
            if let Some(issue) = issue {
                event = event.for_issue(issue);
            }
            if let Some(title) = title {
                event = event.with_title(title);
            }
            if let Some(branch) = branch {
                event = event.on_branch(branch);
            }
            if let Some(worktree) = worktree {
                event = event.in_worktree(worktree);
            }
            if let Some(main_repo) = main_repo {
                event = event.with_main_repo(main_repo);
            }
            if let Some(beads_db) = beads_db {
                event = event.with_beads_db(beads_db);
            }
            if let Some(data) = data {
                let value: serde_json::Value = serde_json::from_str(&data).context("Invalid --data JSON")?;
                event = event.with_data(&value);
            }
            for (key, value) in extra {
                event = event.with_extra(key, value);
            }

            dispatch_and_report(config, &event).await
        }
        EventsCommand::Tool { failed } => {
            let record: ToolEvent = read_stdin_json().await?;
            dispatch_and_report(config, &record.into_event(failed)).await
        }
        EventsCommand::Session { event } => {
            let kind: EventKind = event.parse()?;
            if !kind.as_str().starts_with("session.") {
                eyre::bail!("{} is not a session event", kind);
            }
            let record: SessionEvent = read_stdin_json().await?;
            dispatch_and_report(config, &record.into_event(kind)).await
        }
    }
}

async fn read_stdin_json<T: serde::de::DeserializeOwned>() -> Result<T> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read stdin")?;
    serde_json::from_str(&input).context("Invalid JSON on stdin")
}

/// Dispatch `event`, print per-plugin status and exit 1 if any plugin failed.
async fn dispatch_and_report(config: &Config, event: &Event) -> Result<()> {
    let dispatcher = EventDispatcher::from_config(config);
    let results = dispatcher.dispatch(event).await;
    // Background plugins die with the runtime unless awaited here.
    dispatcher.drain().await;
    if results.is_empty() {
        println!("{} No plugins subscribed to {}", "○".yellow(), event.kind);
        return Ok(());
    }

    let mut failed = false;
    for result in &results {
        if result.is_placeholder() {
            println!("{} {} (running in background)", "→".blue(), result.plugin);
        } else if result.success {
            println!("{} {} ({}ms)", "✓".green(), result.plugin, result.duration.as_millis());
        } else {
            failed = true;
            println!(
                "{} {}: {}",
                "✗".red(),
                result.plugin,
                result.error.as_deref().unwrap_or("failed")
            );
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_config_command(config: &Config, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Validate => {
            match &config.config_path {
                Some(path) => println!("{} Config is valid: {}", "✓".green(), path.display()),
                None => println!("{} No config file found, using defaults", "○".yellow()),
            }
            println!("  Health interval:  {}s", config.daemon.health_interval);
            println!("  Zombie threshold: {}s", config.daemon.zombie_threshold);
            println!("  Auto recover:     {}", config.daemon.auto_recover);
            println!("  Workspaces:       {}", config.worktree.base_path);
            println!("  Plugins:          {}", config.plugins.len());
            for plugin in &config.plugins {
                let mode = if plugin.blocking { "blocking" } else { "async" };
                let state = if plugin.enabled { "" } else { " (disabled)" };
                println!("    {} [{}] {}{}", plugin.name.cyan(), mode, plugin.on.join(", "), state);
            }
            Ok(())
        }
        ConfigCommand::Get { key } => {
            let value = config.get_value(&key)?;
            match value {
                serde_yaml::Value::String(s) => println!("{}", s),
                other => print!("{}", serde_yaml::to_string(&other)?),
            }
            Ok(())
        }
    }
}

async fn run_health(config: &Config, issue: Option<&str>) -> Result<()> {
    let main_repo = main_repo().await?;
    let checker = HealthChecker::new(config, &main_repo, tracker(config, &main_repo));

    let results = match issue {
        Some(id) => match checker.check_task(id).await {
            Some(health) => vec![health],
            None => {
                eprintln!("{} Work unit {} not found", "!".yellow(), id);
                return Ok(());
            }
        },
        None => checker.check_all().await,
    };
    checker.dispatcher().drain().await;

    if results.is_empty() {
        println!("{} No work units in progress", "○".yellow());
    }
    for health in &results {
        print_health(health);
    }
    Ok(())
}

fn print_health(health: &TaskHealth) {
    let icon = if health.is_zombie {
        "✗".red()
    } else if health.alive {
        "✓".green()
    } else {
        "○".yellow()
    };
    println!("{} {} [{}]", icon, health.issue_id.cyan(), health.status);
    println!("  Assignee:  {}", health.assignee.as_deref().unwrap_or("-"));
    let exists = if health.workspace_exists { "" } else { " (missing)" };
    println!("  Workspace: {}{}", health.workspace.display(), exists);
    println!("  Liveness:  {} via {}", if health.alive { "alive" } else { "not alive" }, health.source);
    if let Some(secs) = health.last_seen_secs() {
        println!("  Last seen: {}s ago", secs);
    }
    if health.is_zombie {
        println!("  {}", "ZOMBIE".red().bold());
    }
}

async fn run_finish(config: &Config, issue: &str, no_merge: bool) -> Result<()> {
    let main_repo = main_repo().await?;
    let finisher = Finisher::new(
        config,
        &main_repo,
        GitRefStore::new(&main_repo),
        tracker(config, &main_repo),
    );

    if no_merge {
        let report = finisher.locate(issue).await?;
        println!("{} Workspace preserved at: {}", "○".yellow(), report.workspace.display());
        println!("To merge and clean up later, run:");
        println!("  {}", format!("convoy finish {}", issue).cyan());
        return Ok(());
    }

    println!("{} Finishing {}...", "→".blue(), issue.cyan());
    let report = finisher.finish(issue).await;
    finisher.dispatcher().drain().await;
    print_finish_report(&report?);
    Ok(())
}

fn print_finish_report(report: &FinishReport) {
    let step = |done: bool, label: &str| {
        if done {
            println!("{} {}", "✓".green(), label);
        } else {
            println!("{} {}", "!".yellow(), label);
        }
    };
    step(report.merged, "Merged into main");
    step(report.worktree_removed, "Workspace removed");
    step(report.branch_deleted, "Branch deleted");
    step(report.issue_closed, "Work unit closed");
    for (id, title) in &report.closed_epics {
        println!("{} Epic {} closed: {}", "✓".green(), id.cyan(), title);
    }

    if report.worktree_removed {
        println!("Done! {} merged and cleaned up.", report.issue_id.cyan());
    } else {
        println!(
            "Done! {} merged, but {} needs manual cleanup.",
            report.issue_id.cyan(),
            report.workspace.display()
        );
    }
}

async fn agent_runner(config: &Config) -> Result<AgentRunner<BeadsTracker>> {
    let main_repo = main_repo().await?;
    Ok(AgentRunner::new(config, &main_repo, tracker(config, &main_repo)))
}

async fn run_claim(config: &Config, issue: &str) -> Result<()> {
    let runner = agent_runner(config).await?;
    let claimed = runner.claim(issue).await;
    runner.dispatcher().drain().await;
    let claimed = claimed?;

    println!("{} Claimed {} {}", "✓".green(), issue.cyan(), claimed.issue_title);
    println!("  Workspace: {}", claimed.workspace.display());
    println!("Heartbeat running, press Ctrl-C to stop.");
    wait_for_signal().await;
    claimed.release().await?;
    Ok(())
}

async fn run_agent(config: &Config, issue: &str, command: &[String]) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        eyre::bail!("no agent command given");
    };
    let runner = agent_runner(config).await?;
    println!("{} Running {} for {}", "→".blue(), program, issue.cyan());
    let report = runner.run(issue, program, args).await;
    runner.dispatcher().drain().await;
    let report = report?;

    if report.success() {
        println!("{} Agent finished, run {} to merge", "✓".green(), format!("convoy finish {}", issue).cyan());
        return Ok(());
    }
    eprintln!("{} Agent exited with {}", "✗".red(), report.exit_code);
    if report.unclaimed {
        eprintln!("  {} is back in the open pool", issue);
    }
    std::process::exit(1);
}

async fn run_abort(config: &Config, issue: &str) -> Result<()> {
    let runner = agent_runner(config).await?;
    println!("{} Aborting {}...", "→".blue(), issue.cyan());
    print_abort_report(&runner.abort(issue).await?);
    Ok(())
}

fn print_abort_report(report: &AbortReport) {
    let mark = |done: bool| if done { "✓".green() } else { "○".yellow() };
    println!("{} Reopened in tracker", mark(report.unclaimed));
    println!("{} Workspace removed: {}", mark(report.worktree_removed), report.workspace.display());
    println!("{} Branch deleted", mark(report.branch_deleted));
}

async fn list_worktrees(config: &Config) -> Result<()> {
    let main_repo = main_repo().await?;
    let entries = Git::new(&main_repo).list_worktrees().await?;
    let threshold = config.daemon.zombie_threshold();

    for entry in entries.iter().filter(|e| !e.is_bare) {
        let (icon, detail) = match HeartbeatRecord::read(&entry.path) {
            Some(record) if record.is_fresh(threshold) => (
                "●".green(),
                format!("heartbeat {}s ago (pid {})", record.age().as_secs(), record.pid),
            ),
            Some(record) => (
                "●".yellow(),
                format!("stale heartbeat {}s ago (pid {})", record.age().as_secs(), record.pid),
            ),
            None => ("○".dimmed(), "no heartbeat".to_string()),
        };
        println!(
            "{} {:<30} {} {} {}",
            icon,
            entry.short_branch().cyan(),
            entry.short_head(),
            entry.path.display(),
            detail.dimmed()
        );
    }
    Ok(())
}

async fn main_repo() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Git::main_repo_root(&cwd).await.context("Could not find main repository")
}

fn tracker(config: &Config, main_repo: &Path) -> BeadsTracker {
    BeadsTracker::from_settings(&config.tracker).in_dir(main_repo)
}
