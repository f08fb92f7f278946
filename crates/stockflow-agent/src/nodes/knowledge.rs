use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::types::{ChatMessage, SearchResult};

use super::PROCESS_RESULTS;
use crate::graph::{Node, NodeOutput, RunContext};
use crate::state::{ConversationState, StateUpdate};

const FOUND_MESSAGE: &str =
    "I've found some relevant information from the knowledge base. Let me help you understand it.";

#[derive(Deserialize)]
struct KnowledgePayload {
    search_results: Vec<SearchResult>,
}

/// Lifts knowledge-base tool output into `search_results`.
pub struct ProcessResultsNode;

impl Node for ProcessResultsNode {
    fn run<'a>(
        &'a self,
        state: &'a ConversationState,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            if !state.last_message().is_some_and(|m| m.is_tool_result()) {
                return Err(StockflowError::protocol(
                    PROCESS_RESULTS,
                    "expected tool results to process",
                ));
            }

            // Every result since the model's last turn, in call order
            let trailing = state
                .messages
                .iter()
                .rev()
                .take_while(|m| m.is_tool_result())
                .collect::<Vec<_>>();

            let mut results = Vec::new();
            for msg in trailing.into_iter().rev() {
                let payload: KnowledgePayload =
                    serde_json::from_str(&msg.content).map_err(|e| {
                        StockflowError::protocol(
                            PROCESS_RESULTS,
                            format!("tool result is not a knowledge search payload: {}", e),
                        )
                    })?;
                results.extend(payload.search_results);
            }

            debug!(run_id = %ctx.run_id, collections = results.len(), "Knowledge results processed");
            Ok(StateUpdate::message(ChatMessage::assistant_text(FOUND_MESSAGE))
                .with_search_results(results)
                .into())
        })
    }
}
