//! DAG container for the obscura pipeline scheduler.
//!
//! This crate provides the [`Graph`] type: a directed acyclic graph of
//! processing nodes identified by stable [`NodeId`]s. The graph owns nodes,
//! adjacency lists, and a root-node set; it computes and caches a topological
//! order, and supports deriving minimal sub-graphs that reconnect orphaned
//! nodes back to an already-included node (used when a new pipeline
//! generation reuses parts of the previous one).
//!
//! Mutation happens at configuration time on a single owner; per-frame
//! consumers only see immutable subset clones and `Arc`-shared topological
//! orders, so no live reference into the mutable graph ever crosses a thread
//! boundary.
//!
//! # Example
//!
//! ```rust
//! use obscura_graph::{Graph, NodeId};
//!
//! let mut graph = Graph::new();
//! graph.add_node(NodeId(1), 0).unwrap();
//! graph.add_node(NodeId(2), 1).unwrap();
//! graph.add_edge(NodeId(1), NodeId(2)).unwrap();
//! graph.set_root_nodes(&[NodeId(1)]).unwrap();
//!
//! let order = graph.toposort().unwrap();
//! assert_eq!(&order[..], &[NodeId(1), NodeId(2)]);
//! ```

mod graph;
mod node;

pub use graph::{Graph, GraphError};
pub use node::{NodeData, NodeId};
