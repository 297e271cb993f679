//! Boundary contracts for external collaborators.
//!
//! The scheduler orchestrates node actors, acquires buffers from a provider,
//! and reports results through a sink — all external implementations. These
//! traits are the full surface the core consumes; nothing behind them is
//! specified here.

use std::sync::Arc;

use obscura_graph::NodeId;

use crate::error::Result;
use crate::frame::Frame;
use crate::lifecycle::LifecycleEvent;
use crate::stream::{BufferHandle, StreamId, StreamInfo};

/// A processing stage driven by the scheduler.
///
/// Lifecycle: `init()` → `config()` → repeated `queue()`/`kick()` →
/// `flush()`. `queue` may return [`PipelineError::Backpressure`]
/// (crate::PipelineError::Backpressure) as a transient signal, distinct from
/// hard failure; the scheduler retries it transparently.
pub trait PipelineNode: Send + Sync {
    /// One-time initialization, before `config`.
    fn init(&self) -> Result<()>;

    /// Applies the generation's configuration.
    fn config(&self) -> Result<()>;

    /// Offers a frame to this node. May return backpressure.
    fn queue(&self, frame: &Arc<Frame>) -> Result<()>;

    /// Nudges the node to make progress (used to unblock holders on flush).
    fn kick(&self) {}

    /// Drains everything the node holds.
    fn flush(&self) -> Result<()>;

    /// Drains a single frame. Defaults to a full flush.
    fn flush_frame(&self, _frame: &Arc<Frame>) -> Result<()> {
        self.flush()
    }
}

/// Source of physical buffers.
///
/// `acquire_buffer` is invoked lazily, at most once per stream per frame.
/// `release_buffer` is the exactly-once return path once every user of the
/// buffer has released it.
pub trait BufferProvider: Send + Sync {
    /// Acquires a buffer for one stream of one request.
    fn acquire_buffer(&self, request_no: u64, info: &StreamInfo) -> Result<BufferHandle>;

    /// Returns a fully released buffer to its source.
    fn release_buffer(&self, request_no: u64, stream: StreamId, buffer: BufferHandle);
}

/// One partial-result delivery.
#[derive(Clone, Debug, Default)]
pub struct PartialResult {
    /// Metadata streams whose production completed with this delivery.
    pub produced_meta: Vec<StreamId>,
    /// Number of nodes whose metadata output is still outstanding.
    pub outstanding_meta: usize,
    /// Streams whose buffer acquisition failed.
    pub failed_streams: Vec<StreamId>,
    /// Set exactly once per frame, on the final delivery.
    pub frame_end: bool,
}

/// Consumer of per-frame results.
///
/// Called at least once per frame; exactly once with `frame_end = true`.
pub trait ResultSink: Send + Sync {
    /// Delivers a partial (or final) result for a request.
    fn on_result(&self, request_no: u64, user_id: u32, result: PartialResult);
}

/// Consumer of buffer-lifecycle milestones (drain bookkeeping).
pub trait LifecycleObserver: Send + Sync {
    /// Delivers one lifecycle milestone for a frame.
    fn on_lifecycle_event(&self, frame_no: u64, event: LifecycleEvent);
}

/// Inter-node frame forwarding policy.
///
/// Pluggable; the default implementation performs fan-in gating, delivering
/// a frame to a node only after every predecessor has delivered it.
pub trait FrameDispatcher: Send + Sync {
    /// Called when `from` has finished its work on `frame`.
    fn on_dispatch_frame(&self, frame: &Arc<Frame>, from: NodeId) -> Result<()>;
}
