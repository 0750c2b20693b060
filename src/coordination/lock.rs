//! Distributed merge lock stored as a ref on the shared remote.
//!
//! Only one agent may merge into the main branch at a time. The lock is a
//! ref whose commit carries a single `lock.json` file describing the holder.
//! Acquisition relies on the store refusing to create a ref that already
//! exists, so no additional server is needed.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LockSettings;
use crate::error::Result;

/// Ref that holds the merge lock.
pub const LOCK_REF: &str = "refs/convoy/merge-lock";

/// Name of the metadata file inside the lock commit.
pub const LOCK_FILE: &str = "lock.json";

/// Environment variable overriding the acquisition timeout (seconds).
pub const TIMEOUT_ENV: &str = "CONVOY_LOCK_TIMEOUT";

/// Default time to wait for the lock.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default delay between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Shortest delay between attempts taken from configuration.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a read of the lock ref found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefContent {
    /// The ref does not exist.
    Absent,
    /// The ref exists; content is `None` when it could not be read.
    Present(Option<Vec<u8>>),
}

/// Storage with create-if-absent semantics for a named ref.
#[async_trait]
pub trait RefStore: Send + Sync {
    /// Create `name` holding `content`. Returns `false` if it already exists.
    async fn create_ref(&self, name: &str, content: &[u8], message: &str) -> Result<bool>;

    /// Read the current content of `name`.
    async fn read_ref(&self, name: &str) -> Result<RefContent>;

    /// Delete `name`. Returns `false` if it did not exist.
    async fn delete_ref(&self, name: &str) -> Result<bool>;
}

/// Who holds the lock, recorded inside the lock commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Opaque holder identity, usually an issue id.
    pub holder: String,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// Host the holder runs on.
    pub host: String,
    /// Process id of the holder.
    pub pid: u32,
}

impl LockMetadata {
    /// Metadata describing the current process.
    pub fn current(holder: impl Into<String>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            holder: holder.into(),
            acquired_at: Utc::now(),
            host,
            pid: std::process::id(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// How long the lock has been held.
    pub fn held_for(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.acquired_at)
    }
}

/// Observed state of the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub held: bool,
    /// Holder details; `None` when free or when the metadata was unreadable.
    pub metadata: Option<LockMetadata>,
}

impl LockStatus {
    fn free() -> Self {
        Self {
            held: false,
            metadata: None,
        }
    }

    pub fn holder(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.holder.as_str())
    }
}

/// Result of [`MergeLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lock is ours.
    Acquired(LockMetadata),
    /// Gave up after the timeout.
    TimedOut {
        /// Last holder seen while waiting.
        holder: Option<LockMetadata>,
        waited: Duration,
    },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Result of releasing the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The ref was deleted.
    Released,
    /// Nothing to release.
    AlreadyFree,
    /// Held by someone else; left untouched.
    NotHolder { holder: Option<String> },
    /// The delete failed.
    Failed { error: String },
}

impl ReleaseOutcome {
    /// Whether the lock is free after this call.
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Released | Self::AlreadyFree)
    }
}

/// The merge lock over a [`RefStore`].
pub struct MergeLock<S> {
    store: S,
    timeout: Duration,
    poll_interval: Duration,
}

impl<S: RefStore> MergeLock<S> {
    /// Create a lock with the default timeout, honouring `CONVOY_LOCK_TIMEOUT`.
    pub fn new(store: S) -> Self {
        Self {
            store,
            timeout: env_timeout().unwrap_or(DEFAULT_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Create a lock from configuration. The environment still wins.
    pub fn from_settings(store: S, settings: &LockSettings) -> Self {
        Self {
            store,
            timeout: env_timeout().unwrap_or(Duration::from_secs(settings.timeout)),
            poll_interval: Duration::from_secs(settings.poll_interval).max(MIN_POLL_INTERVAL),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until the lock is ours or the timeout elapses.
    pub async fn acquire(&self, holder: &str) -> AcquireOutcome {
        let start = Instant::now();
        let message = format!("merge lock: {}", holder);
        let mut last_holder = None;

        loop {
            let metadata = LockMetadata::current(holder);
            match self.try_create(&metadata, &message).await {
                Ok(true) => {
                    log::info!("Merge lock acquired by {}", holder);
                    return AcquireOutcome::Acquired(metadata);
                }
                Ok(false) => {
                    let status = self.status().await;
                    log::info!(
                        "Merge lock held by {}, waiting",
                        status.holder().unwrap_or("unknown")
                    );
                    last_holder = status.metadata;
                }
                Err(e) => log::warn!("Merge lock attempt failed: {}", e),
            }

            let waited = start.elapsed();
            if waited >= self.timeout {
                log::warn!("Timed out waiting for merge lock after {:?}", waited);
                return AcquireOutcome::TimedOut {
                    holder: last_holder,
                    waited,
                };
            }
            tokio::time::sleep(self.poll_interval.min(self.timeout - waited)).await;
        }
    }

    async fn try_create(&self, metadata: &LockMetadata, message: &str) -> Result<bool> {
        let content = metadata.to_json()?;
        self.store.create_ref(LOCK_REF, content.as_bytes(), message).await
    }

    /// Release the lock. With a holder, refuse when someone else holds it.
    ///
    /// The delete is attempted whenever the lock is not known to belong to
    /// someone else, so a failed read never leaves our lock behind.
    pub async fn release(&self, holder: Option<&str>) -> ReleaseOutcome {
        if let Some(holder) = holder {
            let status = self.status().await;
            if status.held && status.holder() != Some(holder) {
                log::warn!(
                    "Refusing to release merge lock held by {} (requested by {})",
                    status.holder().unwrap_or("unknown"),
                    holder
                );
                return ReleaseOutcome::NotHolder {
                    holder: status.holder().map(str::to_string),
                };
            }
        }
        self.delete().await
    }

    /// Delete the lock regardless of holder.
    pub async fn force_release(&self) -> ReleaseOutcome {
        log::warn!("Force releasing merge lock");
        self.delete().await
    }

    async fn delete(&self) -> ReleaseOutcome {
        match self.store.delete_ref(LOCK_REF).await {
            Ok(true) => {
                log::info!("Merge lock released");
                ReleaseOutcome::Released
            }
            Ok(false) => ReleaseOutcome::AlreadyFree,
            Err(e) => {
                log::error!("Failed to release merge lock: {}", e);
                ReleaseOutcome::Failed { error: e.to_string() }
            }
        }
    }

    /// Read the lock without changing it.
    pub async fn status(&self) -> LockStatus {
        match self.store.read_ref(LOCK_REF).await {
            Ok(RefContent::Absent) => LockStatus::free(),
            Ok(RefContent::Present(content)) => LockStatus {
                held: true,
                metadata: content.and_then(|bytes| match LockMetadata::from_json(&bytes) {
                    Ok(metadata) => Some(metadata),
                    Err(e) => {
                        log::warn!("Unreadable merge lock metadata: {}", e);
                        None
                    }
                }),
            },
            Err(e) => {
                log::warn!("Could not read merge lock: {}", e);
                LockStatus::free()
            }
        }
    }
}

fn env_timeout() -> Option<Duration> {
    let value = std::env::var(TIMEOUT_ENV).ok()?;
    match value.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            log::warn!("Ignoring invalid {}={}", TIMEOUT_ENV, value);
            None
        }
    }
}
