//! Frames: one capture request's traversal unit through the graph.
//!
//! Binding projects the configured graph generation and node registry into a
//! self-contained, immutable snapshot for one request: a minimal sub-DAG,
//! the resolved per-node stream I/O, and a fresh lifecycle tracker. Node
//! threads only ever see this snapshot, never the live configuration.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use obscura_graph::{Graph, NodeId};
use parking_lot::Mutex;

use crate::actor::{BufferProvider, LifecycleObserver, ResultSink};
use crate::error::{PipelineError, Result};
use crate::lifecycle::{BufferLifecycleTracker, ReleaseState};
use crate::registry::NodeRegistry;
use crate::stream::{BufferHandle, StreamId, StreamInfo, StreamKind};

/// Monotonic frame-number source.
///
/// Never wraps in practice; reset only by explicit control action.
#[derive(Debug, Default)]
pub struct FrameNumberAllocator {
    next: AtomicU64,
}

impl FrameNumberAllocator {
    /// Creates an allocator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next frame number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Resets the sequence to zero.
    pub fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}

/// One request to push a frame through the pipeline.
#[derive(Clone, Debug, Default)]
pub struct FrameRequest {
    /// Caller-assigned request sequence number.
    pub request_no: u64,
    /// Node subset to traverse. Empty means the whole configured graph.
    pub nodes: Vec<NodeId>,
    /// Streams this request touches. Empty means every stream the selected
    /// nodes declare.
    pub streams: BTreeSet<StreamId>,
    /// Whether this is a reprocess (offline) request.
    pub reprocess: bool,
}

/// Resolved stream I/O of one node for one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameNodeIo {
    /// Input stream descriptors, in stream-id order.
    pub inputs: Vec<Arc<StreamInfo>>,
    /// Output stream descriptors, in stream-id order.
    pub outputs: Vec<Arc<StreamInfo>>,
}

impl FrameNodeIo {
    /// Output descriptors of one payload kind.
    pub fn outputs_of_kind(&self, kind: StreamKind) -> impl Iterator<Item = &Arc<StreamInfo>> {
        self.outputs.iter().filter(move |info| info.kind == kind)
    }
}

/// An immutable per-request snapshot of the pipeline, plus its live
/// lifecycle tracking.
pub struct Frame {
    request_no: u64,
    frame_no: u64,
    reprocess: bool,
    graph: Graph,
    topo: Arc<[NodeId]>,
    node_io: HashMap<NodeId, FrameNodeIo>,
    streams: HashMap<StreamId, Arc<StreamInfo>>,
    tracker: BufferLifecycleTracker,
    // Fan-in gating state: per-node count of predecessors that have
    // delivered this frame.
    arrivals: Mutex<HashMap<NodeId, usize>>,
}

impl Frame {
    /// Binds a request against the configured generation.
    ///
    /// Clones the requested node subset out of `graph` (the whole graph when
    /// the request names no nodes), verifies it still forms a rooted DAG,
    /// resolves every selected node's stream I/O against `registry`, and
    /// builds the frame's lifecycle tracker over the sub-DAG's topological
    /// order.
    pub fn bind(
        request: &FrameRequest,
        frame_no: u64,
        user_id: u32,
        graph: &Graph,
        registry: &NodeRegistry,
        provider: Weak<dyn BufferProvider>,
        sink: Weak<dyn ResultSink>,
    ) -> Result<Arc<Self>> {
        let subset: Vec<NodeId> = if request.nodes.is_empty() {
            graph.node_ids().collect()
        } else {
            request.nodes.clone()
        };
        let mut sub = graph.clone_subset(&subset)?;
        let topo = sub.toposort()?;

        let mut node_io = HashMap::new();
        let mut streams: HashMap<StreamId, Arc<StreamInfo>> = HashMap::new();
        for &node in topo.iter() {
            let declared = registry.node_io(node)?;
            let mut io = FrameNodeIo::default();
            for &id in &declared.inputs {
                if request.streams.is_empty() || request.streams.contains(&id) {
                    let info = registry.stream(id)?;
                    streams.insert(id, Arc::clone(&info));
                    io.inputs.push(info);
                }
            }
            for &id in &declared.outputs {
                if request.streams.is_empty() || request.streams.contains(&id) {
                    let info = registry.stream(id)?;
                    streams.insert(id, Arc::clone(&info));
                    io.outputs.push(info);
                }
            }
            node_io.insert(node, io);
        }

        let frame_streams: Vec<Arc<StreamInfo>> = streams.values().cloned().collect();
        let tracker = BufferLifecycleTracker::new(
            request.request_no,
            frame_no,
            user_id,
            &topo,
            &frame_streams,
            |node, stream| {
                node_io
                    .get(&node)
                    .map_or(crate::lifecycle::UserRole::None, |io| {
                        if io.outputs.iter().any(|i| i.id == stream) {
                            crate::lifecycle::UserRole::Producer
                        } else if io.inputs.iter().any(|i| i.id == stream) {
                            crate::lifecycle::UserRole::Consumer
                        } else {
                            crate::lifecycle::UserRole::None
                        }
                    })
            },
            provider,
            sink,
        );

        tracing::debug!(
            "frame_bind: request {} -> frame {frame_no}, {} nodes, {} streams",
            request.request_no,
            topo.len(),
            streams.len()
        );

        Ok(Arc::new(Self {
            request_no: request.request_no,
            frame_no,
            reprocess: request.reprocess,
            graph: sub,
            topo,
            node_io,
            streams,
            tracker,
            arrivals: Mutex::new(HashMap::new()),
        }))
    }

    /// Caller-assigned request number.
    pub fn request_no(&self) -> u64 {
        self.request_no
    }

    /// Allocator-assigned, globally monotonic frame number.
    pub fn frame_no(&self) -> u64 {
        self.frame_no
    }

    /// Whether this frame is a reprocess request.
    pub fn is_reprocess(&self) -> bool {
        self.reprocess
    }

    /// The frame's sub-DAG snapshot.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Topological order of the sub-DAG.
    pub fn topo(&self) -> &Arc<[NodeId]> {
        &self.topo
    }

    /// Resolved I/O of one node for this frame.
    pub fn node_io(&self, node: NodeId) -> Result<&FrameNodeIo> {
        self.node_io
            .get(&node)
            .ok_or(PipelineError::NodeNotFound(node))
    }

    /// The frame's lifecycle tracker.
    pub fn tracker(&self) -> &BufferLifecycleTracker {
        &self.tracker
    }

    /// Subscribes an observer to this frame's lifecycle milestones.
    pub fn register_observer(&self, observer: Weak<dyn LifecycleObserver>) {
        self.tracker.register_observer(observer);
    }

    /// Acquires an image buffer for a node; fails closed if the stream is
    /// not an image stream of this frame.
    pub fn get_image_buffer(&self, stream: StreamId, node: NodeId) -> Result<BufferHandle> {
        self.checked_acquire(stream, node, StreamKind::Image)
    }

    /// Acquires a metadata buffer for a node; fails closed if the stream is
    /// not a metadata stream of this frame.
    pub fn get_meta_buffer(&self, stream: StreamId, node: NodeId) -> Result<BufferHandle> {
        self.checked_acquire(stream, node, StreamKind::Metadata)
    }

    fn checked_acquire(
        &self,
        stream: StreamId,
        node: NodeId,
        kind: StreamKind,
    ) -> Result<BufferHandle> {
        let info = self
            .streams
            .get(&stream)
            .ok_or(PipelineError::StreamNotFound(stream))?;
        if info.kind != kind {
            return Err(PipelineError::BadValue(format!(
                "stream {stream} is {:?}, not {kind:?}",
                info.kind
            )));
        }
        self.tracker.acquire_buffer(stream, node)
    }

    /// Marks one node's release state for one buffer.
    pub fn mark_user_status(
        &self,
        stream: StreamId,
        node: NodeId,
        state: ReleaseState,
    ) -> Result<()> {
        self.tracker.mark_user_status(stream, node, state)
    }

    /// Records that a predecessor delivered this frame to `node`; returns
    /// the updated arrival count.
    pub fn mark_arrival(&self, node: NodeId) -> usize {
        let mut arrivals = self.arrivals.lock();
        let count = arrivals.entry(node).or_insert(0);
        *count += 1;
        *count
    }
}
