//! Graph-driven agent workflows with a human approval gate.
//!
//! A run moves through a fixed graph of nodes over one
//! [`ConversationState`]. The broker workflow suspends at the purchase
//! approval gate; the suspended run is checkpointed and picked up again
//! with [`BrokerService::resume_run`].

pub mod checkpoint;
pub mod graph;
pub mod model;
pub mod nodes;
pub mod service;
pub mod state;
pub mod workflow;

pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use graph::{Edge, Graph, GraphBuilder, GraphExecutor, Node, NodeOutput, Route, RunContext, RunOutcome};
pub use service::{BrokerService, PendingApproval, RunResult};
pub use state::{ConversationState, Overwrite, StateUpdate};
pub use workflow::{broker_graph, knowledge_graph, Services, BROKER_SYSTEM_PROMPT, KNOWLEDGE_SYSTEM_PROMPT};
