//! Pipeline graph — mutation API, cycle detection, and sub-graph derivation.
//!
//! [`Graph`] owns the topology for one pipeline configuration generation.
//! Mutations (add/remove node, add/remove edge, set roots) happen at
//! configuration time; [`toposort()`](Graph::toposort) produces a cached
//! order shared via `Arc` so per-frame consumers never see partial state.
//!
//! Cycle detection lives in the sort itself: an iterative DFS with a
//! three-state visit marker (unvisited / visiting / sorted) that reports
//! [`GraphError::CycleDetected`] when a "visiting" node is revisited. A
//! failed sort leaves the previously cached order untouched.

use std::collections::BTreeMap;
use std::collections::binary_heap::BinaryHeap;
use std::sync::Arc;

use crate::node::{NodeData, NodeId};

/// Errors that can occur during graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The specified node was not found in the graph.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// No edge exists between the two nodes.
    #[error("edge {0} → {1} not found")]
    EdgeNotFound(NodeId, NodeId),

    /// A node with this id already exists.
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),

    /// The node is a current root and cannot be removed.
    #[error("node {0} is a root node")]
    RootInUse(NodeId),

    /// The root set must not be empty.
    #[error("root set is empty")]
    EmptyRoots,

    /// A subset clone excluded one of the graph's roots.
    #[error("subset excludes root {0}")]
    RootExcluded(NodeId),

    /// The graph (or requested subset) has no nodes.
    #[error("graph has no nodes")]
    EmptyGraph,

    /// The node/edge set does not form a DAG.
    #[error("graph contains a cycle")]
    CycleDetected,

    /// No path connects the orphaned node back to the destination graph.
    #[error("no path reconnects orphan {0}")]
    NoPathForOrphan(NodeId),
}

/// Three-state visit marker used by the topological sort.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Sorted,
}

/// Directed acyclic graph of pipeline nodes for one configuration generation.
///
/// Nodes are keyed by caller-assigned [`NodeId`]s in a `BTreeMap` so that
/// iteration (and therefore the topological order among unordered siblings)
/// is deterministic. Edges are encoded as adjacency lists on the nodes.
///
/// The topological order is computed lazily and cached; any mutation
/// invalidates the cache. The cached order is an `Arc<[NodeId]>` handed out
/// to frames as an immutable snapshot.
#[derive(Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, NodeData>,
    roots: Vec<NodeId>,
    topo_cache: Option<Arc<[NodeId]>>,
}

impl Graph {
    /// Creates a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // --- Node mutations ---

    /// Adds a node with the given id and actor-table slot.
    ///
    /// Returns [`GraphError::DuplicateNode`] if the id is already present.
    pub fn add_node(&mut self, id: NodeId, value: usize) -> Result<(), GraphError> {
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        self.nodes.insert(id, NodeData::new(id, value));
        self.topo_cache = None;
        tracing::debug!("graph_add: node {id} (actor slot {value})");
        Ok(())
    }

    /// Removes a node and prunes all edges touching it.
    ///
    /// Fails with [`GraphError::RootInUse`] if the node is a current root,
    /// or [`GraphError::NodeNotFound`] if it is unknown.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        if self.roots.contains(&id) {
            return Err(GraphError::RootInUse(id));
        }
        let node = self.nodes.remove(&id).ok_or(GraphError::NodeNotFound(id))?;
        for pred in &node.incoming {
            if let Some(p) = self.nodes.get_mut(pred) {
                p.outgoing.retain(|n| *n != id);
            }
        }
        for succ in &node.outgoing {
            if let Some(s) = self.nodes.get_mut(succ) {
                s.incoming.retain(|n| *n != id);
            }
        }
        self.topo_cache = None;
        tracing::debug!("graph_remove: node {id}");
        Ok(())
    }

    /// Adds a directed edge between two existing nodes.
    ///
    /// A no-op if the edge is already present. Returns
    /// [`GraphError::NodeNotFound`] if either endpoint is missing.
    /// Cycles are not rejected here — they surface as
    /// [`GraphError::CycleDetected`] from [`toposort()`](Self::toposort).
    pub fn add_edge(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&src) {
            return Err(GraphError::NodeNotFound(src));
        }
        if !self.nodes.contains_key(&dst) {
            return Err(GraphError::NodeNotFound(dst));
        }
        if self.has_edge(src, dst) {
            return Ok(());
        }
        self.nodes.get_mut(&src).ok_or(GraphError::NodeNotFound(src))?.outgoing.push(dst);
        self.nodes.get_mut(&dst).ok_or(GraphError::NodeNotFound(dst))?.incoming.push(src);
        self.topo_cache = None;
        tracing::debug!("graph_connect: {src} → {dst}");
        Ok(())
    }

    /// Removes the edge between two nodes.
    ///
    /// Returns [`GraphError::EdgeNotFound`] if the edge does not exist.
    pub fn remove_edge(&mut self, src: NodeId, dst: NodeId) -> Result<(), GraphError> {
        if !self.has_edge(src, dst) {
            return Err(GraphError::EdgeNotFound(src, dst));
        }
        if let Some(s) = self.nodes.get_mut(&src) {
            s.outgoing.retain(|n| *n != dst);
        }
        if let Some(d) = self.nodes.get_mut(&dst) {
            d.incoming.retain(|n| *n != src);
        }
        self.topo_cache = None;
        tracing::debug!("graph_disconnect: {src} → {dst}");
        Ok(())
    }

    /// Replaces the root-node set.
    ///
    /// Fails with [`GraphError::EmptyRoots`] on an empty set and
    /// [`GraphError::NodeNotFound`] if any id is unknown.
    pub fn set_root_nodes(&mut self, ids: &[NodeId]) -> Result<(), GraphError> {
        if ids.is_empty() {
            return Err(GraphError::EmptyRoots);
        }
        for id in ids {
            if !self.nodes.contains_key(id) {
                return Err(GraphError::NodeNotFound(*id));
            }
        }
        self.roots = ids.to_vec();
        self.topo_cache = None;
        Ok(())
    }

    // --- Queries ---

    /// Returns the node data for an id.
    pub fn node(&self, id: NodeId) -> Result<&NodeData, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Returns whether the node exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Returns whether an edge `src → dst` exists.
    pub fn has_edge(&self, src: NodeId, dst: NodeId) -> bool {
        self.nodes
            .get(&src)
            .is_some_and(|n| n.outgoing.contains(&dst))
    }

    /// Returns the current root set.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Returns the number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of edges.
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.outgoing.len()).sum()
    }

    /// Returns the in-degree of a node.
    pub fn in_degree(&self, id: NodeId) -> Result<usize, GraphError> {
        Ok(self.node(id)?.in_degree())
    }

    /// Rebinds a node's external value. The topological order is unaffected.
    pub fn set_value(&mut self, id: NodeId, value: usize) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(GraphError::NodeNotFound(id))?;
        node.value = value;
        Ok(())
    }

    /// Iterates over all node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    // --- Topological sort ---

    /// Returns the topological order, computing and caching it if needed.
    ///
    /// The order respects every edge (source before destination) and starts
    /// from the root set; nodes unreachable from any root are appended in
    /// ascending id order. A failed sort (cycle) leaves any previously
    /// cached order intact.
    pub fn toposort(&mut self) -> Result<Arc<[NodeId]>, GraphError> {
        if let Some(cached) = &self.topo_cache {
            return Ok(Arc::clone(cached));
        }
        let order: Arc<[NodeId]> = self.compute_toposort()?.into();
        self.topo_cache = Some(Arc::clone(&order));
        tracing::debug!("graph_sort: {} nodes in topo order", order.len());
        Ok(order)
    }

    /// Returns the cached topological order without recomputing.
    pub fn cached_toposort(&self) -> Option<Arc<[NodeId]>> {
        self.topo_cache.as_ref().map(Arc::clone)
    }

    /// Iterative DFS with three-state markers; reverse postorder is the
    /// topological order. Revisiting a "visiting" node means a cycle.
    fn compute_toposort(&self) -> Result<Vec<NodeId>, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut marks: BTreeMap<NodeId, Mark> =
            self.nodes.keys().map(|&id| (id, Mark::Unvisited)).collect();
        let mut postorder = Vec::with_capacity(self.nodes.len());

        // Seed from the roots in declared order, then any remaining nodes in
        // ascending id order so disconnected nodes still appear.
        let seeds: Vec<NodeId> = self
            .roots
            .iter()
            .copied()
            .chain(self.nodes.keys().copied())
            .collect();

        // Stack frames: (node, expanded). A node is pushed unexpanded, marked
        // visiting, re-pushed expanded, then its children are pushed. When the
        // expanded frame pops, every descendant is sorted.
        let mut stack: Vec<(NodeId, bool)> = Vec::new();

        for seed in seeds {
            if marks[&seed] != Mark::Unvisited {
                continue;
            }
            stack.push((seed, false));
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    marks.insert(id, Mark::Sorted);
                    postorder.push(id);
                    continue;
                }
                if marks[&id] != Mark::Unvisited {
                    // Duplicate frame from a diamond; already handled.
                    continue;
                }
                marks.insert(id, Mark::Visiting);
                stack.push((id, true));

                let node = &self.nodes[&id];
                let mut children = node.outgoing.clone();
                children.sort_unstable();
                for &child in children.iter().rev() {
                    match marks[&child] {
                        Mark::Visiting => return Err(GraphError::CycleDetected),
                        Mark::Sorted => {}
                        Mark::Unvisited => stack.push((child, false)),
                    }
                }
            }
        }

        postorder.reverse();
        Ok(postorder)
    }

    // --- Cloning ---

    /// Clones the graph restricted to the given node subset.
    ///
    /// Edges with an endpoint outside the subset are dropped. Fails with
    /// [`GraphError::RootExcluded`] if any current root is missing from the
    /// subset, and [`GraphError::NodeNotFound`] if any requested id is not
    /// in this graph.
    pub fn clone_subset(&self, subset: &[NodeId]) -> Result<Graph, GraphError> {
        if subset.is_empty() {
            return Err(GraphError::EmptyGraph);
        }
        for id in subset {
            if !self.nodes.contains_key(id) {
                return Err(GraphError::NodeNotFound(*id));
            }
        }
        for root in &self.roots {
            if !subset.contains(root) {
                return Err(GraphError::RootExcluded(*root));
            }
        }

        let mut out = Graph::new();
        for id in subset {
            let src = &self.nodes[id];
            let mut node = NodeData::new(*id, src.value);
            node.incoming = src
                .incoming
                .iter()
                .copied()
                .filter(|n| subset.contains(n))
                .collect();
            node.outgoing = src
                .outgoing
                .iter()
                .copied()
                .filter(|n| subset.contains(n))
                .collect();
            out.nodes.insert(*id, node);
        }
        out.roots = self.roots.clone();
        Ok(out)
    }

    // --- Orphan reconnection ---

    /// Pulls each orphaned node (plus a minimal connecting path) into `dest`.
    ///
    /// Used when a new generation reuses part of this graph: `dest` holds the
    /// nodes already chosen, and each orphan must be reconnected to something
    /// already there. For every orphan this walks `self`'s in-edges backwards
    /// in a best-first search ordered by ascending in-degree (minimizing the
    /// number of nodes pulled in), stopping at the first node already present
    /// in `dest`, then inserts every node and edge on that path into `dest`.
    ///
    /// Fails with [`GraphError::NoPathForOrphan`] when an orphan has no path
    /// back to `dest`, leaving `dest` with any earlier orphans' paths applied.
    pub fn derive_paths_for_orphans(
        &self,
        orphans: &[NodeId],
        dest: &mut Graph,
    ) -> Result<(), GraphError> {
        for &orphan in orphans {
            let start = self.node(orphan)?;
            if dest.contains(orphan) && dest.node(orphan)?.in_degree() > 0 {
                continue;
            }

            // Best-first search over predecessors, cheapest in-degree first.
            // parent[p] = the node p has an edge into on the search path.
            let mut parent: BTreeMap<NodeId, NodeId> = BTreeMap::new();
            let mut frontier: BinaryHeap<core::cmp::Reverse<(usize, NodeId)>> = BinaryHeap::new();
            for &pred in &start.incoming {
                parent.insert(pred, orphan);
                frontier.push(core::cmp::Reverse((self.in_degree(pred)?, pred)));
            }

            let mut anchor = None;
            while let Some(core::cmp::Reverse((_, current))) = frontier.pop() {
                if dest.contains(current) {
                    anchor = Some(current);
                    break;
                }
                for &pred in &self.node(current)?.incoming {
                    if pred != orphan && !parent.contains_key(&pred) {
                        parent.insert(pred, current);
                        frontier.push(core::cmp::Reverse((self.in_degree(pred)?, pred)));
                    }
                }
            }

            let anchor = anchor.ok_or(GraphError::NoPathForOrphan(orphan))?;

            // Replay the path anchor → … → orphan into dest.
            let mut current = anchor;
            loop {
                if !dest.contains(current) {
                    dest.add_node(current, self.node(current)?.value)?;
                }
                if current == orphan {
                    break;
                }
                let next = parent[&current];
                if !dest.contains(next) {
                    dest.add_node(next, self.node(next)?.value)?;
                }
                dest.add_edge(current, next)?;
                current = next;
            }
            tracing::debug!("graph_orphan: reconnected {orphan} via {anchor}");
        }
        Ok(())
    }
}
