//! Node identity and adjacency bookkeeping.
//!
//! A node is an external processing stage (sensor capture, ISP stage,
//! encoder) referenced by a stable [`NodeId`]. The graph stores only the
//! node's identity, its slot in the external actor table, and its adjacency
//! lists — the actor itself lives outside this crate.

/// Unique, caller-assigned identifier for a node in the pipeline graph.
///
/// Node IDs are stable across graph generations: a node reused from the
/// previous generation keeps its id, which is what makes reuse lookups and
/// per-node drain waits possible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Per-node bookkeeping stored inside the graph.
#[derive(Clone, Debug)]
pub struct NodeData {
    /// Node identifier.
    pub id: NodeId,
    /// Index into the external node-actor table.
    pub value: usize,
    /// IDs of nodes with an edge into this node.
    pub incoming: Vec<NodeId>,
    /// IDs of nodes this node has an edge to.
    pub outgoing: Vec<NodeId>,
}

impl NodeData {
    /// Creates a new node with no edges.
    pub fn new(id: NodeId, value: usize) -> Self {
        Self {
            id,
            value,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    /// Number of edges arriving at this node.
    #[inline]
    pub fn in_degree(&self) -> usize {
        self.incoming.len()
    }

    /// Number of edges leaving this node.
    #[inline]
    pub fn out_degree(&self) -> usize {
        self.outgoing.len()
    }
}
