//! Bookkeeping of frames currently circulating in the graph.
//!
//! The registry is subscribed as a lifecycle observer on every queued frame;
//! drain milestones prune its pending lists and wake blocked waiters. Waits
//! have no timeout — cancellation is injected by flushing the context, which
//! forces every frame to drain.

use std::collections::HashMap;

use obscura_graph::NodeId;
use parking_lot::{Condvar, Mutex};

use crate::actor::LifecycleObserver;
use crate::frame::Frame;
use crate::lifecycle::LifecycleEvent;
use crate::stream::StreamKind;

#[derive(Debug, Default)]
struct NodePending {
    image: Vec<u64>,
    meta: Vec<u64>,
}

impl NodePending {
    fn is_drained(&self) -> bool {
        self.image.is_empty() && self.meta.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    // Frame numbers not yet fully released.
    pending: Vec<u64>,
    per_node: HashMap<NodeId, NodePending>,
}

/// Tracks all in-flight frames and supports blocking drain waits.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    inner: Mutex<Inner>,
    drained: Condvar,
}

impl InFlightRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly bound frame.
    ///
    /// The frame number joins the global pending list and, for every node of
    /// the frame's toposort with non-empty image or metadata outputs, that
    /// node's per-kind pending list.
    pub fn register_request(&self, frame: &Frame) {
        let frame_no = frame.frame_no();
        let mut inner = self.inner.lock();
        inner.pending.push(frame_no);
        for &node in frame.topo().iter() {
            let Ok(io) = frame.node_io(node) else {
                continue;
            };
            let entry = inner.per_node.entry(node).or_default();
            if io.outputs_of_kind(StreamKind::Image).next().is_some() {
                entry.image.push(frame_no);
            }
            if io.outputs_of_kind(StreamKind::Metadata).next().is_some() {
                entry.meta.push(frame_no);
            }
        }
        tracing::debug!(
            "inflight_add: frame {frame_no}, {} pending",
            inner.pending.len()
        );
    }

    /// Forcibly removes a frame whose delivery failed before any node could
    /// release it. Clears the global pending entry and every per-node
    /// entry, then wakes blocked waiters.
    pub fn discard(&self, frame_no: u64) {
        let mut inner = self.inner.lock();
        inner.pending.retain(|&f| f != frame_no);
        for pending in inner.per_node.values_mut() {
            pending.image.retain(|&f| f != frame_no);
            pending.meta.retain(|&f| f != frame_no);
        }
        tracing::debug!(
            "inflight_discard: frame {frame_no}, {} pending",
            inner.pending.len()
        );
        drop(inner);
        self.drained.notify_all();
    }

    /// Blocks until no frame is in flight.
    pub fn wait_until_drained(&self) {
        let mut inner = self.inner.lock();
        while !inner.pending.is_empty() {
            self.drained.wait(&mut inner);
        }
    }

    /// Blocks until the node has released all its output buffers for every
    /// in-flight frame. A node the registry never saw is trivially drained.
    pub fn wait_until_node_drained(&self, node: NodeId) {
        let mut inner = self.inner.lock();
        while inner
            .per_node
            .get(&node)
            .is_some_and(|p| !p.is_drained())
        {
            self.drained.wait(&mut inner);
        }
    }

    /// Number of frames in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns whether nothing is in flight.
    pub fn is_drained(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }
}

impl LifecycleObserver for InFlightRegistry {
    fn on_lifecycle_event(&self, frame_no: u64, event: LifecycleEvent) {
        let mut inner = self.inner.lock();
        match event {
            LifecycleEvent::AllOutImageBuffersReleased(node) => {
                if let Some(pending) = inner.per_node.get_mut(&node) {
                    pending.image.retain(|&f| f != frame_no);
                }
            }
            LifecycleEvent::AllOutMetaBuffersReleased(node) => {
                if let Some(pending) = inner.per_node.get_mut(&node) {
                    pending.meta.retain(|&f| f != frame_no);
                }
            }
            LifecycleEvent::FrameReleased => {
                inner.pending.retain(|&f| f != frame_no);
                tracing::debug!(
                    "inflight_remove: frame {frame_no}, {} pending",
                    inner.pending.len()
                );
            }
        }
        drop(inner);
        self.drained.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_drained_when_empty() {
        let registry = InFlightRegistry::new();
        assert!(registry.is_drained());
        registry.wait_until_drained(); // returns immediately
        registry.wait_until_node_drained(NodeId(1));
    }

    #[test]
    fn test_events_prune_and_wake() {
        let registry = Arc::new(InFlightRegistry::new());
        {
            let mut inner = registry.inner.lock();
            inner.pending.push(4);
            inner.per_node.insert(
                NodeId(2),
                NodePending {
                    image: vec![4],
                    meta: vec![4],
                },
            );
        }
        assert!(!registry.is_drained());

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry.wait_until_node_drained(NodeId(2));
                registry.wait_until_drained();
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        registry.on_lifecycle_event(4, LifecycleEvent::AllOutImageBuffersReleased(NodeId(2)));
        registry.on_lifecycle_event(4, LifecycleEvent::AllOutMetaBuffersReleased(NodeId(2)));
        registry.on_lifecycle_event(4, LifecycleEvent::FrameReleased);

        waiter.join().unwrap();
        assert!(registry.is_drained());
    }

    #[test]
    fn test_discard_clears_every_list_and_wakes() {
        let registry = Arc::new(InFlightRegistry::new());
        {
            let mut inner = registry.inner.lock();
            inner.pending.push(9);
            inner.per_node.insert(
                NodeId(1),
                NodePending {
                    image: vec![9],
                    meta: vec![9],
                },
            );
        }

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.wait_until_drained())
        };
        std::thread::sleep(Duration::from_millis(20));

        registry.discard(9);
        waiter.join().unwrap();
        assert!(registry.is_drained());
        registry.wait_until_node_drained(NodeId(1)); // returns immediately
    }

    #[test]
    fn test_unrelated_frame_untouched() {
        let registry = InFlightRegistry::new();
        {
            let mut inner = registry.inner.lock();
            inner.pending.push(4);
            inner.pending.push(5);
        }
        registry.on_lifecycle_event(4, LifecycleEvent::FrameReleased);
        assert_eq!(registry.pending_count(), 1);
    }
}
