use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info};

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::event::EventBus;
use stockflow_core::types::{AgentEvent, RunId};

use super::edge::{Edge, Route};
use super::node::{Node, NodeOutput, RunContext};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::state::{ConversationState, StateUpdate};

const DEFAULT_MAX_STEPS: usize = 25;

/// A validated workflow: node table, edge table and entry point.
pub struct Graph {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: String,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Node names, sorted.
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("entry", &self.entry)
            .field("nodes", &self.node_names())
            .field("edges", &self.edges)
            .finish()
    }
}

/// Collects nodes and edges, then checks them in [`GraphBuilder::build`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<(String, Arc<dyn Node>)>,
    edges: Vec<(String, Edge)>,
    entry: Option<String>,
}

impl GraphBuilder {
    pub fn node(mut self, name: impl Into<String>, node: impl Node) -> Self {
        self.nodes.push((name.into(), Arc::new(node)));
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), Edge::Next(to.into())));
        self
    }

    pub fn end(mut self, from: impl Into<String>) -> Self {
        self.edges.push((from.into(), Edge::End));
        self
    }

    pub fn router<F>(mut self, from: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ConversationState) -> Result<Route> + Send + Sync + 'static,
    {
        self.edges.push((from.into(), Edge::router(f)));
        self
    }

    pub fn entry(mut self, node: impl Into<String>) -> Self {
        self.entry = Some(node.into());
        self
    }

    /// Validate and freeze the graph.
    ///
    /// Every node needs exactly one outgoing edge, and the entry and all
    /// static targets must name registered nodes. Router targets can only
    /// be checked at run time.
    pub fn build(self) -> Result<Graph> {
        let mut nodes = HashMap::new();
        for (name, node) in self.nodes {
            if nodes.insert(name.clone(), node).is_some() {
                return Err(StockflowError::Graph(format!("duplicate node '{}'", name)));
            }
        }

        let mut edges = HashMap::new();
        for (from, edge) in self.edges {
            if !nodes.contains_key(&from) {
                return Err(StockflowError::Graph(format!(
                    "edge from unknown node '{}'",
                    from
                )));
            }
            if let Edge::Next(to) = &edge {
                if !nodes.contains_key(to) {
                    return Err(StockflowError::Graph(format!(
                        "edge '{}' -> '{}' targets an unknown node",
                        from, to
                    )));
                }
            }
            if edges.insert(from.clone(), edge).is_some() {
                return Err(StockflowError::Graph(format!(
                    "node '{}' has more than one outgoing edge",
                    from
                )));
            }
        }

        if let Some(missing) = nodes.keys().find(|n| !edges.contains_key(*n)) {
            return Err(StockflowError::Graph(format!(
                "node '{}' has no outgoing edge",
                missing
            )));
        }

        let entry = self
            .entry
            .ok_or_else(|| StockflowError::Graph("no entry node set".into()))?;
        if !nodes.contains_key(&entry) {
            return Err(StockflowError::Graph(format!(
                "entry node '{}' is not registered",
                entry
            )));
        }

        Ok(Graph {
            nodes,
            edges,
            entry,
        })
    }
}

/// How a run (or resume) ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// A terminal route was reached and no work remains.
    Completed {
        run_id: RunId,
        state: ConversationState,
        steps: usize,
    },
    /// A node asked for human input; resume with `token`.
    Interrupted {
        run_id: RunId,
        token: String,
        state: ConversationState,
        reason: String,
    },
}

impl RunOutcome {
    pub fn state(&self) -> &ConversationState {
        match self {
            RunOutcome::Completed { state, .. } | RunOutcome::Interrupted { state, .. } => state,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            RunOutcome::Completed { run_id, .. } | RunOutcome::Interrupted { run_id, .. } => run_id,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted { .. })
    }
}

/// Drives runs through a [`Graph`] one node at a time.
///
/// One executor serves any number of concurrent runs; each run owns its state.
pub struct GraphExecutor {
    graph: Arc<Graph>,
    store: Arc<dyn CheckpointStore>,
    event_bus: Arc<EventBus>,
    max_steps: usize,
}

impl GraphExecutor {
    pub fn new(graph: Graph, store: Arc<dyn CheckpointStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            graph: Arc::new(graph),
            store,
            event_bus,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Cap node executions per `run`/`resume` call.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Start a run at the entry node.
    pub async fn run(&self, initial: ConversationState) -> Result<RunOutcome> {
        if initial.messages.is_empty() {
            return Err(StockflowError::protocol(
                "executor",
                "a run must start with at least one message",
            ));
        }

        let run_id = RunId::new();
        info!(%run_id, entry = %self.graph.entry, "Run started");
        self.event_bus.publish(AgentEvent::RunStarted {
            run_id: run_id.clone(),
        });

        let frontier = VecDeque::from([self.graph.entry.clone()]);
        let result = self.drive(run_id.clone(), initial, frontier).await;
        self.report(&run_id, result)
    }

    /// Resume a suspended run, merging `update` first.
    pub async fn resume(&self, token: &str, update: StateUpdate) -> Result<RunOutcome> {
        self.resume_with(token, move |_| Ok(update)).await
    }

    /// Resume a suspended run with an update computed from its saved state.
    ///
    /// The checkpoint is consumed only once the update merges cleanly; a
    /// failing `f` or a rejected update leaves the run suspended.
    pub async fn resume_with<F>(&self, token: &str, f: F) -> Result<RunOutcome>
    where
        F: FnOnce(&ConversationState) -> Result<StateUpdate>,
    {
        let cp = self
            .store
            .get(token)?
            .ok_or_else(|| StockflowError::RunNotFound(token.to_string()))?;

        let mut state = cp.state.clone();
        let update = f(&state)?;
        state.apply(update)?;

        // Another caller may have resumed the same token in the meantime
        if self.store.take(token)?.is_none() {
            return Err(StockflowError::RunNotFound(token.to_string()));
        }

        let run_id = cp.run_id;
        info!(%run_id, node = %cp.node, "Run resumed");
        self.event_bus.publish(AgentEvent::RunResumed {
            run_id: run_id.clone(),
            token: token.to_string(),
        });

        let mut frontier = VecDeque::from(cp.frontier);
        frontier.push_front(cp.node);
        let result = self.drive(run_id.clone(), state, frontier).await;
        self.report(&run_id, result)
    }

    fn report(&self, run_id: &RunId, result: Result<RunOutcome>) -> Result<RunOutcome> {
        match &result {
            Ok(RunOutcome::Completed { steps, .. }) => {
                info!(%run_id, steps, "Run complete");
                self.event_bus.publish(AgentEvent::RunComplete {
                    run_id: run_id.clone(),
                    steps: *steps,
                });
            }
            Ok(RunOutcome::Interrupted { token, state, .. }) => {
                info!(%run_id, %token, "Run suspended awaiting approval");
                self.event_bus.publish(AgentEvent::ApprovalRequested {
                    run_id: run_id.clone(),
                    token: token.clone(),
                    purchase: state.pending_purchase.clone(),
                });
            }
            Err(e) => {
                error!(%run_id, error = %e, "Run failed");
                self.event_bus.publish(AgentEvent::RunError {
                    run_id: run_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn drive(
        &self,
        run_id: RunId,
        mut state: ConversationState,
        mut frontier: VecDeque<String>,
    ) -> Result<RunOutcome> {
        let ctx = RunContext {
            run_id: run_id.clone(),
            event_bus: self.event_bus.clone(),
        };
        let mut steps = 0;

        while let Some(name) = frontier.pop_front() {
            if steps >= self.max_steps {
                return Err(StockflowError::MaxStepsExceeded(self.max_steps));
            }
            steps += 1;

            let node = self.graph.nodes.get(&name).ok_or_else(|| {
                StockflowError::Graph(format!("node '{}' vanished from graph", name))
            })?;

            debug!(%run_id, node = %name, step = steps, "Executing node");
            self.event_bus.publish(AgentEvent::NodeStarted {
                run_id: run_id.clone(),
                node: name.clone(),
            });
            let started = Instant::now();

            let output = node
                .run(&state, &ctx)
                .await
                .map_err(|e| wrap(&name, e))?;

            match output {
                NodeOutput::Interrupt { reason } => {
                    let token = uuid::Uuid::new_v4().to_string();
                    let cp = Checkpoint {
                        token: token.clone(),
                        run_id: run_id.clone(),
                        node: name,
                        frontier: frontier.into_iter().collect(),
                        state: state.clone(),
                        reason: reason.clone(),
                        created_at: Utc::now(),
                    };
                    self.store.save(&cp)?;
                    return Ok(RunOutcome::Interrupted {
                        run_id,
                        token,
                        state,
                        reason,
                    });
                }
                NodeOutput::Update(update) => {
                    state.apply(update).map_err(|e| wrap(&name, e))?;
                }
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            debug!(%run_id, node = %name, elapsed_ms, messages = state.messages.len(), "Node complete");
            self.event_bus.publish(AgentEvent::NodeFinished {
                run_id: run_id.clone(),
                node: name.clone(),
                elapsed_ms,
            });

            let edge = self.graph.edges.get(&name).ok_or_else(|| {
                StockflowError::Graph(format!("node '{}' has no outgoing edge", name))
            })?;
            let route = edge.route(&state).map_err(|e| wrap(&name, e))?;

            for target in route.targets() {
                if !self.graph.contains(&target) {
                    return Err(StockflowError::UnknownNode {
                        node: target,
                        from: name,
                    });
                }
                if !frontier.contains(&target) {
                    frontier.push_back(target);
                }
            }
        }

        Ok(RunOutcome::Completed {
            run_id,
            state,
            steps,
        })
    }
}

fn wrap(node: &str, source: StockflowError) -> StockflowError {
    StockflowError::Node {
        node: node.to_string(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::graph::node::node_fn;
    use stockflow_core::types::ChatMessage;

    fn reply(text: &'static str) -> impl Fn(&ConversationState) -> Result<NodeOutput> {
        move |_: &ConversationState| Ok(StateUpdate::message(ChatMessage::assistant_text(text)).into())
    }

    fn executor(graph: Graph) -> GraphExecutor {
        GraphExecutor::new(
            graph,
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(EventBus::default()),
        )
    }

    fn start() -> ConversationState {
        ConversationState::new(vec![ChatMessage::user("go")])
    }

    fn texts(state: &ConversationState) -> Vec<&str> {
        state.messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn builder_rejects_bad_graphs() {
        let missing_target = Graph::builder()
            .node("a", node_fn(reply("a")))
            .edge("a", "b")
            .entry("a")
            .build();
        assert!(matches!(missing_target, Err(StockflowError::Graph(_))));

        let no_entry = Graph::builder()
            .node("a", node_fn(reply("a")))
            .end("a")
            .build();
        assert!(matches!(no_entry, Err(StockflowError::Graph(_))));

        let dangling_node = Graph::builder()
            .node("a", node_fn(reply("a")))
            .node("b", node_fn(reply("b")))
            .end("a")
            .entry("a")
            .build();
        assert!(matches!(dangling_node, Err(StockflowError::Graph(_))));
    }

    #[tokio::test]
    async fn runs_static_chain_to_end() {
        let graph = Graph::builder()
            .node("a", node_fn(reply("a")))
            .node("b", node_fn(reply("b")))
            .edge("a", "b")
            .end("b")
            .entry("a")
            .build()
            .unwrap();

        match executor(graph).run(start()).await.unwrap() {
            RunOutcome::Completed { state, steps, .. } => {
                assert_eq!(steps, 2);
                assert_eq!(texts(&state), vec!["go", "a", "b"]);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fan_out_of_same_node_runs_once() {
        let graph = Graph::builder()
            .node("a", node_fn(reply("a")))
            .node("tools", node_fn(reply("tools")))
            .router("a", |_| Ok(Route::FanOut(vec!["tools".into(), "tools".into()])))
            .end("tools")
            .entry("a")
            .build()
            .unwrap();

        let outcome = executor(graph).run(start()).await.unwrap();
        assert_eq!(texts(outcome.state()), vec!["go", "a", "tools"]);
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let graph = Graph::builder()
            .node("a", node_fn(reply("a")))
            .end("a")
            .entry("a")
            .build()
            .unwrap();
        let err = executor(graph)
            .run(ConversationState::default())
            .await
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn node_errors_name_the_node() {
        let graph = Graph::builder()
            .node(
                "boom",
                node_fn(|_| Err(StockflowError::protocol("boom", "bad input"))),
            )
            .end("boom")
            .entry("boom")
            .build()
            .unwrap();
        let err = executor(graph).run(start()).await.unwrap_err();
        match err {
            StockflowError::Node { node, .. } => assert_eq!(node, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn router_to_unknown_node_fails() {
        let graph = Graph::builder()
            .node("a", node_fn(reply("a")))
            .router("a", |_| Ok(Route::single("nowhere")))
            .entry("a")
            .build()
            .unwrap();
        let err = executor(graph).run(start()).await.unwrap_err();
        assert!(matches!(
            err,
            StockflowError::UnknownNode { ref node, ref from } if node == "nowhere" && from == "a"
        ));
    }

    #[tokio::test]
    async fn loops_are_capped() {
        let graph = Graph::builder()
            .node("a", node_fn(reply("a")))
            .edge("a", "a")
            .entry("a")
            .build()
            .unwrap();
        let err = executor(graph)
            .with_max_steps(5)
            .run(start())
            .await
            .unwrap_err();
        assert!(matches!(err, StockflowError::MaxStepsExceeded(5)));
    }

    #[tokio::test]
    async fn interrupt_then_resume_reruns_the_node() {
        // Gate passes once a "yes" message is present
        let gate = node_fn(|s: &ConversationState| {
            Ok(if s.messages.iter().any(|m| m.content == "yes") {
                StateUpdate::empty().into()
            } else {
                NodeOutput::interrupt("confirm?")
            })
        });
        let graph = Graph::builder()
            .node("gate", gate)
            .node("after", node_fn(reply("done")))
            .edge("gate", "after")
            .end("after")
            .entry("gate")
            .build()
            .unwrap();
        let exec = executor(graph);

        let token = match exec.run(start()).await.unwrap() {
            RunOutcome::Interrupted { token, reason, .. } => {
                assert_eq!(reason, "confirm?");
                token
            }
            other => panic!("expected interruption, got {:?}", other),
        };
        assert_eq!(exec.store().list().unwrap().len(), 1);

        // An empty update re-suspends under a new token
        let second = match exec.resume(&token, StateUpdate::empty()).await.unwrap() {
            RunOutcome::Interrupted { token: t, .. } => t,
            other => panic!("expected interruption, got {:?}", other),
        };
        assert_ne!(second, token);
        assert!(matches!(
            exec.resume(&token, StateUpdate::empty()).await,
            Err(StockflowError::RunNotFound(_))
        ));

        let outcome = exec
            .resume(&second, StateUpdate::message(ChatMessage::user("yes")))
            .await
            .unwrap();
        assert_eq!(texts(outcome.state()), vec!["go", "yes", "done"]);
        assert!(exec.store().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_resume_update_keeps_checkpoint() {
        let graph = Graph::builder()
            .node("gate", node_fn(|_| Ok(NodeOutput::interrupt("confirm?"))))
            .end("gate")
            .entry("gate")
            .build()
            .unwrap();
        let exec = executor(graph);
        let outcome = exec.run(start()).await.unwrap();
        let RunOutcome::Interrupted { token, .. } = outcome else {
            panic!("expected interruption");
        };

        let err = exec
            .resume(
                &token,
                StateUpdate::message(ChatMessage::tool_result("call_missing", "{}")),
            )
            .await
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(exec.store().get(&token).unwrap().is_some());
    }

    #[tokio::test]
    async fn publishes_lifecycle_events() {
        let graph = Graph::builder()
            .node("a", node_fn(reply("a")))
            .end("a")
            .entry("a")
            .build()
            .unwrap();
        let exec = executor(graph);
        let mut rx = exec.event_bus().subscribe();
        exec.run(start()).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                AgentEvent::RunStarted { .. } => "started",
                AgentEvent::NodeStarted { .. } => "node_started",
                AgentEvent::NodeFinished { .. } => "node_finished",
                AgentEvent::RunComplete { .. } => "complete",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["started", "node_started", "node_finished", "complete"]);
    }
}
