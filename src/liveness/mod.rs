//! Agent liveness: heartbeat records, process scans and zombie detection.

pub mod health;
pub mod heartbeat;
pub mod process;

pub use health::{HealthChecker, LivenessSource, TaskHealth};
pub use heartbeat::{HeartbeatHandle, HeartbeatRecord, HeartbeatWriter, heartbeat_path};
pub use process::{is_pid_alive, process_in_dir};
