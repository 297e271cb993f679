//! Per-buffer user graph: who touches a buffer, in what role, and whether
//! they have released it yet.
//!
//! Every buffer in a frame owns a [`UsersManager`] whose user list is the
//! frame's full topological order. Producers and consumers carry a pending
//! release state and a [`Fence`] signaled on release; nodes that never touch
//! the stream get role `None` and are pre-resolved so they can't stall the
//! handoff chain.

use std::sync::Arc;

use obscura_graph::NodeId;
use parking_lot::{Condvar, Mutex};

use crate::error::{PipelineError, Result};

/// Role a node plays for one buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserRole {
    /// The node writes this buffer.
    Producer,
    /// The node reads this buffer.
    Consumer,
    /// The node never touches this buffer (pre-resolved).
    None,
}

/// Release progress of one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseState {
    /// The user has not finished with the buffer.
    Pending,
    /// The user has handed the buffer onward but not fully released it.
    PreReleased,
    /// The user is done with the buffer.
    Released,
}

/// One-shot release synchronization primitive.
///
/// Signaled exactly once when the owning user releases its buffer; waiters
/// block on a condvar until then.
#[derive(Debug, Default)]
pub struct Fence {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Fence {
    /// Creates an unsignaled fence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the fence and wakes all waiters. Idempotent.
    pub fn signal(&self) {
        let mut state = self.signaled.lock();
        *state = true;
        self.cv.notify_all();
    }

    /// Blocks until the fence is signaled.
    pub fn wait(&self) {
        let mut state = self.signaled.lock();
        while !*state {
            self.cv.wait(&mut state);
        }
    }

    /// Blocks up to `timeout`; returns whether the fence was signaled.
    pub fn wait_for(&self, timeout: std::time::Duration) -> bool {
        let mut state = self.signaled.lock();
        if *state {
            return true;
        }
        self.cv.wait_for(&mut state, timeout);
        *state
    }

    /// Returns whether the fence has been signaled.
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }
}

/// One user entry in a buffer's user graph.
#[derive(Clone, Debug)]
pub struct BufferUser {
    /// Owning node.
    pub node: NodeId,
    /// Role for this buffer.
    pub role: UserRole,
    /// Current release progress.
    pub state: ReleaseState,
    /// Signaled when this user releases.
    pub fence: Arc<Fence>,
}

/// Result of marking one user's status.
#[derive(Clone, Copy, Debug)]
pub struct MarkOutcome {
    /// The user's role.
    pub role: UserRole,
    /// Whether the state actually changed.
    pub changed: bool,
    /// Whether the user newly reached `Released`.
    pub newly_released: bool,
    /// Whether the buffer just became fully resolved (all users released or
    /// pre-released).
    pub newly_resolved: bool,
}

/// Ordered release tracking for one buffer.
///
/// Users appear in the frame's topological order; the buffer becomes
/// returnable to its provider only once every user has released or
/// pre-released, and a user may only acquire it once every earlier-ordered
/// user has done so — strict in-order handoff.
#[derive(Clone, Debug)]
pub struct UsersManager {
    users: Vec<BufferUser>,
}

impl UsersManager {
    /// Builds the user list for a buffer over the frame's topological order.
    ///
    /// `role_of` assigns each node its role; `None`-role users start out
    /// released with their fence already signaled.
    pub fn new(topo: &[NodeId], mut role_of: impl FnMut(NodeId) -> UserRole) -> Self {
        let users = topo
            .iter()
            .map(|&node| {
                let role = role_of(node);
                let fence = Arc::new(Fence::new());
                let state = if role == UserRole::None {
                    fence.signal();
                    ReleaseState::Released
                } else {
                    ReleaseState::Pending
                };
                BufferUser {
                    node,
                    role,
                    state,
                    fence,
                }
            })
            .collect();
        Self { users }
    }

    fn index_of(&self, node: NodeId) -> Result<usize> {
        self.users
            .iter()
            .position(|u| u.node == node)
            .ok_or(PipelineError::NodeNotFound(node))
    }

    /// Marks one user's release state.
    ///
    /// Transitions only move forward (`Pending → PreReleased → Released`);
    /// a downgrade is ignored. Returns what changed so the caller can update
    /// node-status bookkeeping and return the buffer when it resolves.
    pub fn mark(&mut self, node: NodeId, state: ReleaseState) -> Result<MarkOutcome> {
        let idx = self.index_of(node)?;
        let was_resolved = self.all_resolved();
        let user = &mut self.users[idx];

        let changed = match (user.state, state) {
            (ReleaseState::Pending, ReleaseState::PreReleased | ReleaseState::Released)
            | (ReleaseState::PreReleased, ReleaseState::Released) => {
                user.state = state;
                true
            }
            _ => false,
        };
        let newly_released = changed && state == ReleaseState::Released;
        if newly_released {
            user.fence.signal();
        }
        let role = user.role;

        Ok(MarkOutcome {
            role,
            changed,
            newly_released,
            newly_resolved: !was_resolved && self.all_resolved(),
        })
    }

    /// Force-releases a user (used when its buffer acquisition fails) so
    /// downstream accounting is not stalled.
    pub fn force_release(&mut self, node: NodeId) -> Result<MarkOutcome> {
        self.mark(node, ReleaseState::Released)
    }

    /// Returns whether every user has released or pre-released.
    pub fn all_resolved(&self) -> bool {
        self.users.iter().all(|u| u.state != ReleaseState::Pending)
    }

    /// Returns whether every user has fully released.
    pub fn fully_released(&self) -> bool {
        self.users
            .iter()
            .all(|u| u.state == ReleaseState::Released)
    }

    /// Returns whether every user ordered before `node` has released or
    /// pre-released — the in-order handoff gate for acquisition.
    pub fn predecessors_resolved(&self, node: NodeId) -> Result<bool> {
        let idx = self.index_of(node)?;
        Ok(self.users[..idx]
            .iter()
            .all(|u| u.state != ReleaseState::Pending))
    }

    /// Returns the state of one user.
    pub fn state_of(&self, node: NodeId) -> Result<ReleaseState> {
        Ok(self.users[self.index_of(node)?].state)
    }

    /// Returns one user's release fence.
    pub fn fence_of(&self, node: NodeId) -> Result<Arc<Fence>> {
        Ok(Arc::clone(&self.users[self.index_of(node)?].fence))
    }

    /// Iterates the users in topological order.
    pub fn users(&self) -> &[BufferUser] {
        &self.users
    }
}
