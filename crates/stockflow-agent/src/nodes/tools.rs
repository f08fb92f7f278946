use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::types::{AgentEvent, ChatMessage, ToolContext};
use stockflow_tools::ToolRegistry;

use super::TOOLS;
use crate::graph::{Node, NodeOutput, RunContext};
use crate::state::{ConversationState, StateUpdate};

/// Executes every tool call of the last assistant message, in order.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

impl Node for ToolDispatcher {
    fn run<'a>(
        &'a self,
        state: &'a ConversationState,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let last = state
                .last_message()
                .filter(|m| m.is_assistant())
                .ok_or_else(|| {
                    StockflowError::protocol(TOOLS, "last message is not an assistant message")
                })?;
            if !last.has_tool_calls() {
                return Err(StockflowError::protocol(
                    TOOLS,
                    "assistant message has no tool calls",
                ));
            }

            // Reject unknown names before running anything
            if let Some(unknown) = last
                .tool_calls
                .iter()
                .find(|tc| !self.registry.contains(&tc.name))
            {
                return Err(StockflowError::protocol(
                    TOOLS,
                    format!("unknown tool '{}'", unknown.name),
                ));
            }

            let mut results = Vec::with_capacity(last.tool_calls.len());
            for call in &last.tool_calls {
                ctx.event_bus.publish(AgentEvent::ToolStart {
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                });

                let result = self
                    .registry
                    .execute(
                        &call.name,
                        call.arguments.clone(),
                        ToolContext::for_run(&ctx.run_id),
                    )
                    .await?;

                if result.is_error {
                    warn!(tool = %call.name, call_id = %call.id, "Tool reported an error");
                } else {
                    debug!(tool = %call.name, call_id = %call.id, bytes = result.content.len(), "Tool finished");
                }
                ctx.event_bus.publish(AgentEvent::ToolEnd {
                    name: call.name.clone(),
                    result: result.clone(),
                });

                results.push(ChatMessage::tool_result(call.id.clone(), result.content));
            }

            Ok(StateUpdate::messages(results).into())
        })
    }
}
