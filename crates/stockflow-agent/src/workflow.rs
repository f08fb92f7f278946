//! The two shipped workflows, wired as graphs.

use std::sync::Arc;

use stockflow_core::config::ModelConfig;
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::LlmClient;
use stockflow_tools::{purchase_stock_definition, ToolRegistry};

use crate::graph::{Graph, Route};
use crate::nodes::{
    route_after_agent, route_after_approval, route_after_prepare, AgentNode, ApprovalGate,
    ExecutePurchaseNode, PreparePurchaseNode, ProcessResultsNode, ToolDispatcher, AGENT,
    EXECUTE_PURCHASE, PREPARE_PURCHASE, PROCESS_RESULTS, PURCHASE_APPROVAL, TOOLS,
};
use crate::state::ConversationState;

pub const BROKER_SYSTEM_PROMPT: &str = "You're an expert financial analyst, tasked with answering \
the user's questions about a given company or companies. You do not have up to date information \
on the companies, so you must call tools when answering the user's questions. All financial data \
tools require a company ticker to be passed in as a parameter. If you do not know the ticker, you \
should use the web search tool to find it.";

pub const KNOWLEDGE_SYSTEM_PROMPT: &str = "You are a knowledgeable assistant with access to a \
vector knowledge base. Your task is to help users find relevant information by querying it. Use \
the knowledge_search tool to find information relevant to the user's question. The knowledge base \
contains embedded documents that can be searched semantically.";

const KNOWLEDGE_SEARCH: &str = "knowledge_search";

/// Collaborators shared by every node of a workflow.
#[derive(Clone)]
pub struct Services {
    pub llm: Arc<dyn LlmClient>,
    pub model: ModelConfig,
    pub tools: Arc<ToolRegistry>,
}

/// The stock-broker workflow:
///
/// ```text
/// agent ─┬─> tools ──> agent
///        ├─> prepare_purchase_details ─┬─> purchase_approval ─┬─> execute_purchase ─> end
///        │                             └─> agent              └─> agent
///        └─> end
/// ```
pub fn broker_graph(services: &Services, system_prompt: Option<&str>) -> Result<Graph> {
    let mut catalog = services.tools.definitions();
    catalog.push(purchase_stock_definition());

    let agent = AgentNode::new(
        services.llm.clone(),
        services.model.clone(),
        catalog,
        system_prompt.unwrap_or(BROKER_SYSTEM_PROMPT),
    );
    let prepare = PreparePurchaseNode::new(
        services.llm.clone(),
        services.model.clone(),
        services.tools.clone(),
    )?;

    Graph::builder()
        .node(AGENT, agent)
        .node(TOOLS, ToolDispatcher::new(services.tools.clone()))
        .node(PREPARE_PURCHASE, prepare)
        .node(PURCHASE_APPROVAL, ApprovalGate)
        .node(EXECUTE_PURCHASE, ExecutePurchaseNode)
        .entry(AGENT)
        .router(AGENT, route_after_agent)
        .edge(TOOLS, AGENT)
        .router(PREPARE_PURCHASE, route_after_prepare)
        .router(PURCHASE_APPROVAL, route_after_approval)
        .end(EXECUTE_PURCHASE)
        .build()
}

/// Question answering over a knowledge base:
/// `agent -> tools -> process_results -> agent`, ending when the model
/// stops calling tools.
pub fn knowledge_graph(services: &Services, system_prompt: Option<&str>) -> Result<Graph> {
    if !services.tools.contains(KNOWLEDGE_SEARCH) {
        return Err(StockflowError::Config(format!(
            "the knowledge workflow needs the '{}' tool",
            KNOWLEDGE_SEARCH
        )));
    }

    let agent = AgentNode::new(
        services.llm.clone(),
        services.model.clone(),
        services.tools.definitions(),
        system_prompt.unwrap_or(KNOWLEDGE_SYSTEM_PROMPT),
    );

    Graph::builder()
        .node(AGENT, agent)
        .node(TOOLS, ToolDispatcher::new(services.tools.clone()))
        .node(PROCESS_RESULTS, ProcessResultsNode)
        .entry(AGENT)
        .router(AGENT, |state: &ConversationState| {
            // Any tool call goes to the dispatcher; there is no purchase path here
            Ok(match route_after_agent(state)? {
                Route::Terminal => Route::Terminal,
                _ => Route::single(TOOLS),
            })
        })
        .edge(TOOLS, PROCESS_RESULTS)
        .edge(PROCESS_RESULTS, AGENT)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_test_utils::{MockLlm, MockRetriever, StaticTool};
    use stockflow_tools::builtin::knowledge_search::KnowledgeSearchTool;

    fn services(registry: ToolRegistry) -> Services {
        Services {
            llm: Arc::new(MockLlm::new()),
            model: ModelConfig::new("m"),
            tools: Arc::new(registry),
        }
    }

    fn market_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(StaticTool::new("web_search", ""));
        registry.register(StaticTool::new("price_snapshot", "{}"));
        registry
    }

    #[test]
    fn broker_graph_has_every_node() {
        let graph = broker_graph(&services(market_registry()), None).unwrap();
        let mut names = graph.node_names();
        names.sort();
        assert_eq!(
            names,
            vec![
                "agent",
                "execute_purchase",
                "prepare_purchase_details",
                "purchase_approval",
                "tools"
            ]
        );
        assert_eq!(graph.entry(), "agent");
    }

    #[test]
    fn broker_graph_needs_market_tools() {
        let err = broker_graph(&services(ToolRegistry::new()), None).unwrap_err();
        assert!(matches!(err, StockflowError::Config(_)));
    }

    #[test]
    fn knowledge_graph_needs_knowledge_search() {
        assert!(knowledge_graph(&services(market_registry()), None).is_err());

        let mut registry = ToolRegistry::new();
        registry.register(KnowledgeSearchTool::new(Arc::new(MockRetriever::new(vec![]))));
        let graph = knowledge_graph(&services(registry), None).unwrap();
        assert!(graph.contains(PROCESS_RESULTS));
    }
}
