//! Concurrent buffer lifecycle tracking.
//!
//! Every frame owns a [`BufferLifecycleTracker`] built from the frame's
//! topological order and resolved stream I/O. The tracker enforces strict
//! in-order buffer handoff between users, returns each physical buffer to
//! its provider exactly once, and fires drain milestones and the final
//! frame-released notification.

mod buffer_map;
mod status;
mod tracker;
mod users;

pub use buffer_map::{AcquireState, BufferCategory, BufferItem, BufferMap};
pub use status::{DrainedSet, NodeStatus, PendingSet};
pub use tracker::{BufferLifecycleTracker, LifecycleEvent};
pub use users::{BufferUser, Fence, MarkOutcome, ReleaseState, UserRole, UsersManager};
