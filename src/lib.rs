//! Convoy: coordination for parallel coding agents sharing one repository.
//!
//! Convoy serializes merges with a lock stored on the git remote, routes
//! lifecycle events to shell plugins, and watches agent workspaces for
//! work units nobody is working on anymore.

pub mod agent;
pub mod config;
pub mod coordination;
pub mod daemon;
pub mod error;
pub mod finish;
pub mod git;
pub mod liveness;
pub mod tracker;

pub use agent::AgentRunner;
pub use config::Config;
pub use coordination::{Event, EventDispatcher, EventKind, MergeLock};
pub use daemon::{Daemon, DaemonConfig};
pub use error::{Error, Result};
pub use git::{Git, GitRefStore};
pub use tracker::{BeadsTracker, WorkTracker};
