//! Coordination between agents sharing one repository.
//!
//! - Events: what happened, exported to plugins as environment variables
//! - Dispatch: runs subscribed plugins for an event
//! - Lock: the merge lock serializing integration into the main branch

pub mod dispatch;
pub mod events;
pub mod lock;

pub use dispatch::{DispatchLog, EventDispatcher, PluginResult};
pub use events::{Event, EventKind, SessionEvent, ToolEvent};
pub use lock::{AcquireOutcome, LockMetadata, LockStatus, MergeLock, RefStore, ReleaseOutcome};
