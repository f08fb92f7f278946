use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use stockflow_core::config::ModelConfig;
use stockflow_core::error::Result;
use stockflow_core::traits::LlmClient;
use stockflow_core::types::{ChatMessage, ToolDefinition};
use stockflow_tools::PURCHASE_STOCK;

use super::{PREPARE_PURCHASE, TOOLS};
use crate::graph::{Node, NodeOutput, Route, RunContext};
use crate::model;
use crate::state::{ConversationState, StateUpdate};

/// One model turn: system prompt + history + tool catalog in, one
/// assistant message out.
pub struct AgentNode {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    tools: Vec<ToolDefinition>,
    system_prompt: String,
}

impl AgentNode {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        config: ModelConfig,
        tools: Vec<ToolDefinition>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            config,
            tools,
            system_prompt: system_prompt.into(),
        }
    }
}

impl Node for AgentNode {
    fn run<'a>(
        &'a self,
        state: &'a ConversationState,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let mut messages = Vec::with_capacity(state.messages.len() + 1);
            messages.push(ChatMessage::system(self.system_prompt.clone()));
            messages.extend(state.messages.iter().cloned());

            let reply = model::complete(
                self.llm.as_ref(),
                &self.config,
                messages,
                &self.tools,
                Some(ctx.event_bus.as_ref()),
            )
            .await?;

            debug!(
                run_id = %ctx.run_id,
                tool_calls = reply.tool_calls.len(),
                text_len = reply.content.len(),
                "Agent turn complete"
            );
            Ok(StateUpdate::message(reply).into())
        })
    }
}

/// Router after the model turn.
///
/// No tool calls ends the run. A `purchase_stock` call anywhere in the
/// message goes to purchase preparation; otherwise every call fans out
/// to the tool dispatcher.
pub fn route_after_agent(state: &ConversationState) -> Result<Route> {
    let Some(last) = state.last_message() else {
        return Ok(Route::Terminal);
    };
    if !last.is_assistant() || !last.has_tool_calls() {
        return Ok(Route::Terminal);
    }
    if last.tool_call(PURCHASE_STOCK).is_some() {
        return Ok(Route::single(PREPARE_PURCHASE));
    }
    Ok(Route::FanOut(
        last.tool_calls.iter().map(|_| TOOLS.to_string()).collect(),
    ))
}
