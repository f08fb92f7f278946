//! Graph execution engine.
//!
//! A workflow is a fixed table of named [`Node`]s, each with one outgoing
//! [`Edge`]: end, a static successor, or a router over the merged state.
//! The [`GraphExecutor`] runs one node at a time from a FIFO frontier,
//! merging each node's update before consulting its edge. A node may
//! interrupt the run instead; the executor then checkpoints the state and
//! returns a resume token.

pub mod edge;
pub mod executor;
pub mod node;

pub use edge::{Edge, Route, RouterFn};
pub use executor::{Graph, GraphBuilder, GraphExecutor, RunOutcome};
pub use node::{node_fn, FnNode, Node, NodeOutput, RunContext};
