//! Per-frame pipeline scheduling for the obscura camera core.
//!
//! A [`PipelineContext`] owns one configuration generation: a DAG of
//! processing nodes (built on [`obscura_graph`]), the registry of declared
//! stream I/O, and the actor table driving the external processing stages.
//! Each capture request is bound into a [`Frame`] — an immutable snapshot of
//! the sub-DAG and stream maps it needs — dispatched to the root nodes with
//! backpressure retry, and forwarded along edges with fan-in gating. The
//! frame's [`BufferLifecycleTracker`] follows every buffer it touches until
//! all users release it, returning each buffer to its provider exactly once
//! and notifying drain milestones along the way.
//!
//! External collaborators (node actors, the buffer provider, the result
//! sink) plug in through the traits in [`actor`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//!
//! use obscura_core::{
//!     BufferUsage, FrameRequest, PipelineContext, SchedulerConfig, StreamId, StreamInfo,
//!     StreamOrigin,
//! };
//! use obscura_graph::NodeId;
//!
//! # fn collaborators() -> (
//! #     std::sync::Weak<dyn obscura_core::BufferProvider>,
//! #     std::sync::Weak<dyn obscura_core::ResultSink>,
//! #     Arc<dyn obscura_core::PipelineNode>,
//! # ) { unimplemented!() }
//! # fn main() -> obscura_core::Result<()> {
//! let (provider, sink, sensor) = collaborators();
//! let context = PipelineContext::new(SchedulerConfig::default(), provider, sink);
//!
//! context.begin_configure(None)?;
//! context.add_node(NodeId(1), sensor)?;
//! context.add_stream(Arc::new(StreamInfo::image(
//!     StreamId(100),
//!     StreamOrigin::App,
//!     1920,
//!     1080,
//!     0,
//! )))?;
//! context.set_node_io(
//!     NodeId(1),
//!     BTreeSet::new(),
//!     BTreeSet::from([StreamId(100)]),
//!     BufferUsage::CPU_WRITE,
//! )?;
//! context.set_root_nodes(&[NodeId(1)])?;
//! context.end_configure(false)?;
//!
//! let frame = context.queue(&FrameRequest {
//!     request_no: 0,
//!     ..FrameRequest::default()
//! })?;
//! context.flush()?;
//! # let _ = frame;
//! # Ok(())
//! # }
//! ```

mod actor;
mod config;
mod error;
mod frame;
mod inflight;
mod registry;
mod stream;

pub mod lifecycle;
pub mod scheduler;

pub use actor::{
    BufferProvider, FrameDispatcher, LifecycleObserver, PartialResult, PipelineNode, ResultSink,
};
pub use config::SchedulerConfig;
pub use error::{PipelineError, Result};
pub use frame::{Frame, FrameNodeIo, FrameNumberAllocator, FrameRequest};
pub use inflight::InFlightRegistry;
pub use lifecycle::{BufferLifecycleTracker, LifecycleEvent, ReleaseState, UserRole};
pub use registry::{NodeIo, NodeRegistry};
pub use scheduler::{ContextState, FanInDispatcher, PipelineContext};
pub use stream::{BufferHandle, BufferUsage, StreamId, StreamInfo, StreamKind, StreamOrigin};
