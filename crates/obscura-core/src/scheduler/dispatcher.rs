//! Default inter-node frame forwarding with fan-in gating.

use std::sync::Arc;

use obscura_graph::NodeId;

use crate::actor::{FrameDispatcher, PipelineNode};
use crate::error::{PipelineError, Result};
use crate::frame::Frame;

/// Forwards a frame along out-edges, withholding delivery to a multi-input
/// node until every predecessor has delivered — so each node sees exactly
/// one `queue()` per frame, after all its producers.
pub struct FanInDispatcher {
    actors: Vec<Arc<dyn PipelineNode>>,
}

impl FanInDispatcher {
    /// Creates a dispatcher over one generation's actor table.
    pub fn new(actors: Vec<Arc<dyn PipelineNode>>) -> Self {
        Self { actors }
    }

    fn actor(&self, frame: &Frame, node: NodeId) -> Result<&Arc<dyn PipelineNode>> {
        let index = frame.graph().node(node)?.value;
        self.actors
            .get(index)
            .ok_or(PipelineError::DeadObject("node actor table"))
    }
}

impl FrameDispatcher for FanInDispatcher {
    fn on_dispatch_frame(&self, frame: &Arc<Frame>, from: NodeId) -> Result<()> {
        let successors = frame.graph().node(from)?.outgoing.clone();
        for dst in successors {
            let arrived = frame.mark_arrival(dst);
            let needed = frame.graph().in_degree(dst)?;
            if arrived < needed {
                tracing::trace!(
                    "dispatch_gate: frame {} at {dst}, {arrived}/{needed}",
                    frame.frame_no()
                );
                continue;
            }
            if arrived > needed {
                tracing::warn!(
                    "dispatch_gate: frame {} over-delivered to {dst} ({arrived}/{needed})",
                    frame.frame_no()
                );
                continue;
            }
            tracing::debug!("dispatch: frame {} {from} -> {dst}", frame.frame_no());
            self.actor(frame, dst)?.queue(frame)?;
        }
        Ok(())
    }
}
