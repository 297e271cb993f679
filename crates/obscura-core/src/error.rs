//! Error types for the pipeline scheduler.

use obscura_graph::{GraphError, NodeId};

use crate::stream::StreamId;

/// Errors surfaced by the pipeline scheduler and lifecycle tracker.
///
/// [`Backpressure`](PipelineError::Backpressure) is the one transient
/// variant: it signals "retry later" from a node actor's enqueue and is
/// absorbed by the scheduler's retry loop, never surfaced to the frame
/// producer as a hard failure.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A graph mutation or sort failed (includes cycle detection).
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// The referenced node is not part of the current generation.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// The referenced stream was never declared.
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    /// Malformed configuration input.
    #[error("bad value: {0}")]
    BadValue(String),

    /// Operation attempted before configuration completed.
    #[error("pipeline context is not configured")]
    NotInitialized,

    /// Operation not legal in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// A required weak reference (provider, sink, observer) has expired.
    #[error("dead object: {0}")]
    DeadObject(&'static str),

    /// Transient "not ready" signal from a node's enqueue; retry.
    #[error("node reported backpressure")]
    Backpressure,

    /// The buffer cannot be handed out: acquisition failed, every user has
    /// already released it, or an earlier-ordered user still holds it.
    #[error("buffer for stream {0} unavailable")]
    BufferUnavailable(StreamId),
}

impl PipelineError {
    /// Returns whether this is the transient backpressure signal.
    #[inline]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Backpressure)
    }

    /// Returns whether this is a cycle-detection failure.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Graph(GraphError::CycleDetected))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, PipelineError>;
