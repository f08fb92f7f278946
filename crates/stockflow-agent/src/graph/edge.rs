use std::fmt;
use std::sync::Arc;

use stockflow_core::error::Result;

use crate::state::ConversationState;

/// Where to go after a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Stop: nothing more to run from here.
    Terminal,
    Single(String),
    /// Several targets, queued in order. Repeats of an already queued
    /// node collapse into one execution.
    FanOut(Vec<String>),
}

impl Route {
    pub fn single(node: impl Into<String>) -> Self {
        Self::Single(node.into())
    }

    pub fn targets(self) -> Vec<String> {
        match self {
            Route::Terminal => Vec::new(),
            Route::Single(node) => vec![node],
            Route::FanOut(nodes) => nodes,
        }
    }
}

pub type RouterFn = Arc<dyn Fn(&ConversationState) -> Result<Route> + Send + Sync>;

/// Outgoing transition of a node.
#[derive(Clone)]
pub enum Edge {
    End,
    Next(String),
    /// Decided from the state after the node's update is merged.
    Router(RouterFn),
}

impl Edge {
    pub fn next(node: impl Into<String>) -> Self {
        Self::Next(node.into())
    }

    pub fn router<F>(f: F) -> Self
    where
        F: Fn(&ConversationState) -> Result<Route> + Send + Sync + 'static,
    {
        Self::Router(Arc::new(f))
    }

    /// Resolve the edge against the current state.
    pub fn route(&self, state: &ConversationState) -> Result<Route> {
        match self {
            Edge::End => Ok(Route::Terminal),
            Edge::Next(node) => Ok(Route::Single(node.clone())),
            Edge::Router(f) => f(state),
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::End => write!(f, "End"),
            Edge::Next(node) => write!(f, "Next({})", node),
            Edge::Router(_) => write!(f, "Router(..)"),
        }
    }
}
