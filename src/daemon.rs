//! Background health-check daemon.
//!
//! The daemon is a single instance per state directory, guarded by a PID
//! file. It runs the health check on a fixed interval until SIGTERM or
//! SIGINT arrives.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::liveness::health::HealthChecker;
use crate::liveness::heartbeat::wait_for_signal;
use crate::liveness::process::is_pid_alive;
use crate::tracker::WorkTracker;

/// Pause after a failed iteration.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Granularity of the interval sleep.
const SLEEP_STEP: Duration = Duration::from_secs(1);

/// How long `stop` waits after SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the PID file.
    pub pid_path: PathBuf,
    /// Where the detached daemon sends stdout and stderr.
    pub log_path: PathBuf,
    /// Time between health checks.
    pub health_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("convoy");

        Self {
            pid_path: base.join("daemon.pid"),
            log_path: base.join("daemon.log"),
            health_interval: Duration::from_secs(60),
        }
    }
}

/// Exclusive claim on the PID file, released on drop.
///
/// An advisory lock on `<pid file>.lock` is held for the guard's lifetime,
/// so two daemons starting at once cannot both pass the liveness check.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
    pid: u32,
    _lock: fs::File,
}

impl PidGuard {
    /// Record this process in `path`, refusing when a live daemon is recorded.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("pid.lock");
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        // Released by the kernel when the file is closed, even on a crash.
        let rc = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::Daemon(format!(
                "another daemon instance holds {}",
                lock_path.display()
            )));
        }

        if let Some(pid) = read_pid(path)
            && pid != std::process::id()
            && is_pid_alive(pid)
        {
            return Err(Error::Daemon(format!("daemon already running (pid {})", pid)));
        }

        let pid = std::process::id();
        let tmp = path.with_extension("pid.tmp");
        fs::write(&tmp, format!("{}\n", pid))?;
        fs::rename(&tmp, path)?;

        Ok(Self {
            path: path.to_path_buf(),
            pid,
            _lock: lock,
        })
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        // Leave the file alone if another instance has replaced it.
        if read_pid(&self.path) == Some(self.pid)
            && let Err(e) = fs::remove_file(&self.path)
        {
            log::warn!("Failed to remove PID file {}: {}", self.path.display(), e);
        }
    }
}

/// Read the PID recorded in `path`.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// PID of the running daemon, if any.
pub fn running_pid(config: &DaemonConfig) -> Option<u32> {
    read_pid(&config.pid_path).filter(|pid| is_pid_alive(*pid))
}

/// Check if the daemon is running.
pub fn is_daemon_running(config: &DaemonConfig) -> bool {
    running_pid(config).is_some()
}

/// Result of [`stop_daemon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32 },
    Killed { pid: u32 },
}

/// Stop the daemon: SIGTERM, then SIGKILL if it outlives the grace period.
pub async fn stop_daemon(config: &DaemonConfig) -> Result<StopOutcome> {
    let outcome = match running_pid(config) {
        None => StopOutcome::NotRunning,
        Some(pid) => {
            send_signal(pid, libc::SIGTERM)?;
            if wait_for_exit(pid, STOP_GRACE).await {
                StopOutcome::Stopped { pid }
            } else {
                log::warn!("Daemon {} ignored SIGTERM, sending SIGKILL", pid);
                send_signal(pid, libc::SIGKILL)?;
                wait_for_exit(pid, Duration::from_secs(1)).await;
                StopOutcome::Killed { pid }
            }
        }
    };

    match fs::remove_file(&config.pid_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(outcome)
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let target = libc::pid_t::try_from(pid).map_err(|_| Error::Daemon(format!("invalid pid {}", pid)))?;
    let rc = unsafe { libc::kill(target, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(Error::Daemon(format!("failed to signal pid {}: {}", pid, err)));
        }
    }
    Ok(())
}

async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < limit {
        if !is_pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(poll).await;
        waited += poll;
    }
    !is_pid_alive(pid)
}

/// Point stdin at `/dev/null` and stdout/stderr at `log_path`.
///
/// Used by the detached daemon so logging and panics land in its log file.
pub fn redirect_stdio(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let null = fs::File::open("/dev/null")?;
    let log = fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    let pairs = [
        (null.as_raw_fd(), libc::STDIN_FILENO),
        (log.as_raw_fd(), libc::STDOUT_FILENO),
        (log.as_raw_fd(), libc::STDERR_FILENO),
    ];
    for (from, to) in pairs {
        if unsafe { libc::dup2(from, to) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Runs the health check on a fixed interval.
pub struct Scheduler<T> {
    checker: Arc<HealthChecker<T>>,
    interval: Duration,
    backoff: Duration,
    shutdown: broadcast::Sender<()>,
}

impl<T: WorkTracker + 'static> Scheduler<T> {
    pub fn new(checker: HealthChecker<T>, interval: Duration) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            checker: Arc::new(checker),
            interval,
            backoff: ERROR_BACKOFF,
            shutdown,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sender that stops [`Scheduler::run`].
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Run until shutdown. Returns the number of completed iterations.
    pub async fn run(&self) -> Result<u64> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut completed = 0;

        log::info!("Health scheduler started, interval {:?}", self.interval);
        loop {
            let checker = Arc::clone(&self.checker);
            // Each pass runs in its own task so a panic is contained.
            let delay = match tokio::spawn(async move { checker.check_all().await }).await {
                Ok(results) => {
                    completed += 1;
                    let zombies = results.iter().filter(|h| h.is_zombie).count();
                    log::info!("Health check: {} in progress, {} zombie(s)", results.len(), zombies);
                    self.interval
                }
                Err(e) => {
                    log::error!("Health check failed: {}", e);
                    self.backoff
                }
            };

            if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                log::info!("Health scheduler stopping");
                self.checker.dispatcher().drain().await;
                return Ok(completed);
            }
        }
    }
}

/// Sleep in short steps; `true` when shutdown was requested.
async fn sleep_or_shutdown(total: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    let mut remaining = total;
    loop {
        let step = remaining.min(SLEEP_STEP);
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = shutdown.recv() => return true,
        }
        remaining = remaining.saturating_sub(step);
        if remaining.is_zero() {
            return false;
        }
    }
}

/// The convoy daemon.
pub struct Daemon<T> {
    config: DaemonConfig,
    scheduler: Scheduler<T>,
}

impl<T: WorkTracker + 'static> Daemon<T> {
    pub fn new(config: DaemonConfig, checker: HealthChecker<T>) -> Self {
        let scheduler = Scheduler::new(checker, config.health_interval);
        Self { config, scheduler }
    }

    /// Run the daemon until SIGTERM or SIGINT.
    pub async fn run(&self) -> Result<()> {
        let _guard = PidGuard::acquire(&self.config.pid_path)?;
        log::info!(
            "Daemon started (pid {}), PID file {}",
            std::process::id(),
            self.config.pid_path.display()
        );

        let shutdown = self.scheduler.shutdown_handle();
        let signals = tokio::spawn(async move {
            wait_for_signal().await;
            let _ = shutdown.send(());
        });

        let result = self.scheduler.run().await;
        signals.abort();
        result.map(|_| ())
    }
}
