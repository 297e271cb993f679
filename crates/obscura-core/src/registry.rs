//! Per-generation node registry.
//!
//! Maps every node of one graph generation to its declared input/output
//! stream sets and usage hints, and owns the generation's stream table.
//! Per-frame binding resolves stream ids against this registry to build the
//! frame's concrete stream-info maps.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use obscura_graph::NodeId;

use crate::error::{PipelineError, Result};
use crate::lifecycle::UserRole;
use crate::stream::{BufferUsage, StreamId, StreamInfo, StreamKind};

/// Declared I/O of one node: which streams it consumes and produces.
#[derive(Clone, Debug, Default)]
pub struct NodeIo {
    /// Streams this node reads.
    pub inputs: BTreeSet<StreamId>,
    /// Streams this node writes.
    pub outputs: BTreeSet<StreamId>,
    /// Usage hints for buffers this node touches.
    pub usage: BufferUsage,
}

/// Node-id → I/O declaration mapping for one graph generation, plus the
/// generation's stream table.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    io: HashMap<NodeId, NodeIo>,
    streams: HashMap<StreamId, Arc<StreamInfo>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream descriptor.
    ///
    /// Duplicate registration of the same id is a `BadValue` error.
    pub fn register_stream(&mut self, info: Arc<StreamInfo>) -> Result<()> {
        if self.streams.contains_key(&info.id) {
            return Err(PipelineError::BadValue(format!(
                "stream {} already registered",
                info.id
            )));
        }
        tracing::debug!("registry_add: stream {} ({:?})", info.id, info.kind);
        self.streams.insert(info.id, info);
        Ok(())
    }

    /// Registers a node's I/O declaration.
    ///
    /// Fails with `BadValue` if both stream sets are empty, and with
    /// [`PipelineError::StreamNotFound`] if any referenced stream is not in
    /// the stream table.
    pub fn register_node_io(
        &mut self,
        node: NodeId,
        inputs: BTreeSet<StreamId>,
        outputs: BTreeSet<StreamId>,
        usage: BufferUsage,
    ) -> Result<()> {
        if inputs.is_empty() && outputs.is_empty() {
            return Err(PipelineError::BadValue(format!(
                "node {node} declares neither inputs nor outputs"
            )));
        }
        for id in inputs.iter().chain(outputs.iter()) {
            if !self.streams.contains_key(id) {
                return Err(PipelineError::StreamNotFound(*id));
            }
        }
        self.io.insert(
            node,
            NodeIo {
                inputs,
                outputs,
                usage,
            },
        );
        Ok(())
    }

    /// Returns the stream descriptor for an id.
    pub fn stream(&self, id: StreamId) -> Result<Arc<StreamInfo>> {
        self.streams
            .get(&id)
            .cloned()
            .ok_or(PipelineError::StreamNotFound(id))
    }

    /// Returns whether the stream is registered.
    pub fn contains_stream(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// Returns the I/O declaration for a node.
    pub fn node_io(&self, node: NodeId) -> Result<&NodeIo> {
        self.io.get(&node).ok_or(PipelineError::NodeNotFound(node))
    }

    /// Returns the role a node plays for a stream, per its declaration.
    pub fn role(&self, node: NodeId, stream: StreamId) -> UserRole {
        match self.io.get(&node) {
            Some(io) if io.outputs.contains(&stream) => UserRole::Producer,
            Some(io) if io.inputs.contains(&stream) => UserRole::Consumer,
            _ => UserRole::None,
        }
    }

    /// Returns the node's output streams of the given kind.
    pub fn outputs_of_kind(&self, node: NodeId, kind: StreamKind) -> Vec<StreamId> {
        self.io
            .get(&node)
            .map(|io| {
                io.outputs
                    .iter()
                    .copied()
                    .filter(|id| {
                        self.streams
                            .get(id)
                            .is_some_and(|info| info.kind == kind)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Number of nodes with I/O declarations.
    pub fn node_count(&self) -> usize {
        self.io.len()
    }
}
