use futures::future::BoxFuture;
use tracing::{debug, info};

use stockflow_core::approval::ApprovalDecision;
use stockflow_core::error::{Result, StockflowError};
use stockflow_tools::PURCHASE_STOCK;

use super::{AGENT, EXECUTE_PURCHASE, PURCHASE_APPROVAL};
use crate::graph::{Node, NodeOutput, Route, RunContext};
use crate::state::{ConversationState, StateUpdate};

pub const APPROVAL_PROMPT: &str = "Please confirm the purchase before executing.";

/// The human's answer to the purchase, if the last message carries one.
pub fn decision(state: &ConversationState) -> Option<ApprovalDecision> {
    let last = state.last_message().filter(|m| m.is_tool_result())?;
    let id = last.tool_call_id.as_deref()?;
    if state.tool_call_name(id) != Some(PURCHASE_STOCK) {
        return None;
    }
    ApprovalDecision::from_tool_content(&last.content)
}

fn answered(state: &ConversationState) -> bool {
    state
        .last_message()
        .filter(|m| m.is_tool_result())
        .and_then(|m| m.tool_call_id.as_deref())
        .and_then(|id| state.tool_call_name(id))
        == Some(PURCHASE_STOCK)
}

/// Suspends the run until the pending purchase has a human answer.
///
/// It runs twice per approval: first it interrupts, then on resume it finds
/// the answer appended as a `purchase_stock` tool result and passes through.
pub struct ApprovalGate;

impl Node for ApprovalGate {
    fn run<'a>(
        &'a self,
        state: &'a ConversationState,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            if answered(state) {
                debug!(run_id = %ctx.run_id, "Purchase answered, gate open");
                return Ok(StateUpdate::empty().into());
            }
            info!(run_id = %ctx.run_id, "Purchase awaiting human approval");
            Ok(NodeOutput::interrupt(APPROVAL_PROMPT))
        })
    }
}

/// Approved goes to execution; a rejection, cancellation or unreadable
/// answer goes back to the model, which sees the answer in the history.
pub fn route_after_approval(state: &ConversationState) -> Result<Route> {
    if state.pending_purchase.is_none() {
        return Err(StockflowError::protocol(
            PURCHASE_APPROVAL,
            "no pending purchase to approve",
        ));
    }
    Ok(match decision(state) {
        Some(ApprovalDecision::Approved) => Route::single(EXECUTE_PURCHASE),
        _ => Route::single(AGENT),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use serde_json::json;
    use stockflow_core::event::EventBus;
    use stockflow_core::types::{ChatMessage, PurchaseDetails, RunId, ToolCall};

    fn ctx() -> RunContext {
        RunContext {
            run_id: RunId::new(),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    fn awaiting() -> ConversationState {
        let mut state = ConversationState::new(vec![
            ChatMessage::user("Buy 10 ACME"),
            ChatMessage::assistant_tool_calls(
                "",
                vec![ToolCall::new("p1", PURCHASE_STOCK, json!({"ticker": "ACME"}))],
            ),
        ]);
        state.pending_purchase = Some(PurchaseDetails {
            ticker: "ACME".into(),
            quantity: 10,
            max_purchase_price: 12.5,
        });
        state
    }

    fn answer(state: &mut ConversationState, decision: ApprovalDecision) {
        state
            .apply(StateUpdate::message(ChatMessage::tool_result(
                "p1",
                decision.to_tool_content(),
            )))
            .unwrap();
    }

    #[tokio::test]
    async fn interrupts_until_answered() {
        let mut state = awaiting();
        let out = ApprovalGate.run(&state, &ctx()).await.unwrap();
        assert_eq!(out, NodeOutput::interrupt(APPROVAL_PROMPT));

        answer(&mut state, ApprovalDecision::Approved);
        let out = ApprovalGate.run(&state, &ctx()).await.unwrap();
        assert_eq!(out, NodeOutput::Update(StateUpdate::empty()));
    }

    #[tokio::test]
    async fn unrelated_tool_result_does_not_open_the_gate() {
        let mut state = awaiting();
        state.messages.push(ChatMessage::assistant_tool_calls(
            "",
            vec![ToolCall::new("w1", "web_search", json!({}))],
        ));
        state
            .messages
            .push(ChatMessage::tool_result("w1", r#"{"approve": true}"#));
        let out = ApprovalGate.run(&state, &ctx()).await.unwrap();
        assert!(matches!(out, NodeOutput::Interrupt { .. }));
    }

    #[test]
    fn routes_by_decision() {
        let mut approved = awaiting();
        answer(&mut approved, ApprovalDecision::Approved);
        assert_eq!(
            route_after_approval(&approved).unwrap(),
            Route::single(EXECUTE_PURCHASE)
        );

        let mut rejected = awaiting();
        answer(
            &mut rejected,
            ApprovalDecision::Rejected {
                reason: Some("too pricey".into()),
            },
        );
        assert_eq!(route_after_approval(&rejected).unwrap(), Route::single(AGENT));

        let mut garbled = awaiting();
        garbled
            .apply(StateUpdate::message(ChatMessage::tool_result("p1", "sure?")))
            .unwrap();
        assert_eq!(route_after_approval(&garbled).unwrap(), Route::single(AGENT));
    }

    #[test]
    fn routing_without_pending_purchase_is_an_error() {
        let mut state = awaiting();
        state.pending_purchase = None;
        answer(&mut state, ApprovalDecision::Approved);
        assert!(route_after_approval(&state).unwrap_err().is_protocol());
    }
}
