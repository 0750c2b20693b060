//! Error types for convoy.

use thiserror::Error;

/// Convoy error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Daemon error
    #[error("daemon error: {0}")]
    Daemon(String),

    /// Unknown event name
    #[error("unknown event type '{name}'")]
    UnknownEvent { name: String },

    /// Tracker command failed
    #[error("tracker command '{command}' failed: {message}")]
    Tracker { command: String, message: String },

    /// Path is not inside a git repository
    #[error("path is not inside a git repository: {path}")]
    NotGitRepo { path: std::path::PathBuf },

    /// Git command failed
    #[error("git command '{command}' failed: {stderr}")]
    Git { command: String, stderr: String },

    /// Gave up waiting for the merge lock
    #[error(
        "timed out after {waited_secs}s waiting for merge lock held by {holder}. \
         Use 'convoy lock status' to check, or 'convoy lock release' to force-release"
    )]
    LockTimeout { holder: String, waited_secs: u64 },

    /// Workspace directory missing
    #[error("workspace not found: {path}")]
    WorkspaceNotFound { path: std::path::PathBuf },
}

/// Result type alias for convoy.
pub type Result<T> = std::result::Result<T, Error>;
