use std::sync::Arc;

use futures::future::BoxFuture;

use stockflow_core::error::Result;
use stockflow_core::event::EventBus;
use stockflow_core::types::RunId;

use crate::state::{ConversationState, StateUpdate};

/// Per-run handles passed to every node.
pub struct RunContext {
    pub run_id: RunId,
    pub event_bus: Arc<EventBus>,
}

/// What a node produced.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// Merge this update and follow the node's edge.
    Update(StateUpdate),
    /// Suspend the run here until a human supplies input.
    Interrupt { reason: String },
}

impl NodeOutput {
    pub fn interrupt(reason: impl Into<String>) -> Self {
        Self::Interrupt {
            reason: reason.into(),
        }
    }
}

impl From<StateUpdate> for NodeOutput {
    fn from(update: StateUpdate) -> Self {
        Self::Update(update)
    }
}

/// A unit of work in a workflow graph.
///
/// Nodes only read the state; changes flow back through the returned update.
pub trait Node: Send + Sync + 'static {
    fn run<'a>(
        &'a self,
        state: &'a ConversationState,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeOutput>>;
}

/// Adapts a synchronous closure into a [`Node`].
pub struct FnNode<F>(F);

/// Wrap a synchronous function of the state as a node.
pub fn node_fn<F>(f: F) -> FnNode<F>
where
    F: Fn(&ConversationState) -> Result<NodeOutput> + Send + Sync + 'static,
{
    FnNode(f)
}

impl<F> Node for FnNode<F>
where
    F: Fn(&ConversationState) -> Result<NodeOutput> + Send + Sync + 'static,
{
    fn run<'a>(
        &'a self,
        state: &'a ConversationState,
        _ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        let out = (self.0)(state);
        Box::pin(async move { out })
    }
}
