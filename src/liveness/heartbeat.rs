//! Heartbeat records.
//!
//! A writer bound to one workspace rewrites `<workspace>/.convoy/heartbeat`
//! on a fixed interval. The health checker reads the record's age to decide
//! whether the agent in that workspace is still alive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::CONFIG_DIR;
use crate::error::{Error, Result};

/// Default time between heartbeats.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before retrying a failed write.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Location of the heartbeat record for a workspace.
pub fn heartbeat_path(workspace: &Path) -> PathBuf {
    workspace.join(CONFIG_DIR).join("heartbeat")
}

/// Contents of a heartbeat file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
}

impl HeartbeatRecord {
    /// A record stamped now for this process.
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            pid: std::process::id(),
        }
    }

    /// Read the record for `workspace`. `None` when missing or unreadable.
    pub fn read(workspace: &Path) -> Option<Self> {
        let path = heartbeat_path(workspace);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("Ignoring unreadable heartbeat {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Time since the record was written; zero for timestamps in the future.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, threshold: Duration) -> bool {
        self.age() < threshold
    }
}

/// Periodically refreshes the heartbeat record of one workspace.
#[derive(Debug, Clone)]
pub struct HeartbeatWriter {
    path: PathBuf,
    interval: Duration,
}

impl HeartbeatWriter {
    pub fn new(workspace: &Path, interval: Duration) -> Self {
        Self {
            path: heartbeat_path(workspace),
            interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one record, synced to disk.
    pub async fn beat(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string(&HeartbeatRecord::now())?;
        let mut file = tokio::fs::File::create(&self.path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Beat until `shutdown` fires, then remove the record.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        log::info!("Heartbeat writer started for {}", self.path.display());

        loop {
            let delay = match self.beat().await {
                Ok(()) => self.interval,
                Err(e) => {
                    log::error!("Failed to write heartbeat: {}", e);
                    RETRY_DELAY
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    log::info!("Heartbeat writer stopping");
                    break;
                }
            }
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the first record, then keep beating on a background task.
    pub async fn start(self) -> Result<HeartbeatHandle> {
        self.beat().await?;
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(async move { self.run(rx).await });
        Ok(HeartbeatHandle { shutdown, task })
    }

    /// Beat until SIGTERM or SIGINT.
    pub async fn run_until_signal(&self) -> Result<()> {
        let (tx, rx) = broadcast::channel(1);
        let signals = tokio::spawn(async move {
            wait_for_signal().await;
            let _ = tx.send(());
        });

        let result = self.run(rx).await;
        signals.abort();
        result
    }
}

/// A heartbeat running in the background, see [`HeartbeatWriter::start`].
#[derive(Debug)]
pub struct HeartbeatHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl HeartbeatHandle {
    /// Stop beating and remove the record.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| Error::Daemon(format!("heartbeat task failed: {}", e)))?
    }
}

/// Resolve on the first SIGTERM or SIGINT.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                }
            }
            Err(e) => {
                log::warn!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
