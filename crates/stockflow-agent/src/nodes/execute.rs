use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::types::{ChatMessage, PurchaseDetails, ToolCall};

use super::EXECUTE_PURCHASE;
use crate::graph::{Node, NodeOutput, RunContext};
use crate::state::{ConversationState, StateUpdate};

/// Human-readable confirmation of a completed purchase.
pub fn purchase_summary(details: &PurchaseDetails) -> String {
    format!(
        "Successfully purchased {} share(s) of {} at ${}/share.",
        details.quantity, details.ticker, details.max_purchase_price
    )
}

/// Records the approved purchase in the history and clears it.
///
/// No order is placed anywhere; the node writes the call, its result and a
/// summary so the conversation reads as if a broker had filled it.
pub struct ExecutePurchaseNode;

impl Node for ExecutePurchaseNode {
    fn run<'a>(
        &'a self,
        state: &'a ConversationState,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let details = state.pending_purchase.as_ref().ok_or_else(|| {
                StockflowError::protocol(EXECUTE_PURCHASE, "no approved purchase to execute")
            })?;

            let call_id = format!("tool_{}", uuid::Uuid::new_v4().simple());
            let call = ToolCall::new(
                call_id.clone(),
                EXECUTE_PURCHASE,
                json!({
                    "ticker": details.ticker,
                    "quantity": details.quantity,
                    "maxPurchasePrice": details.max_purchase_price,
                }),
            );

            info!(
                run_id = %ctx.run_id,
                ticker = %details.ticker,
                quantity = details.quantity,
                "Purchase executed"
            );
            Ok(StateUpdate::message(ChatMessage::assistant_tool_calls("", vec![call]))
                .with_message(ChatMessage::tool_result(
                    call_id,
                    json!({ "success": true }).to_string(),
                ))
                .with_message(ChatMessage::assistant_text(purchase_summary(details)))
                .clear_pending_purchase()
                .into())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use stockflow_core::event::EventBus;
    use stockflow_core::types::RunId;

    fn ctx() -> RunContext {
        RunContext {
            run_id: RunId::new(),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    #[tokio::test]
    async fn writes_call_result_and_summary() {
        let mut state = ConversationState::new(vec![ChatMessage::user("buy")]);
        state.pending_purchase = Some(PurchaseDetails {
            ticker: "ACME".into(),
            quantity: 10,
            max_purchase_price: 187.5,
        });

        let NodeOutput::Update(update) = ExecutePurchaseNode.run(&state, &ctx()).await.unwrap() else {
            panic!("execute never interrupts");
        };
        state.apply(update).unwrap();

        assert!(state.pending_purchase.is_none());
        assert_eq!(state.messages.len(), 4);

        let call = &state.messages[1].tool_calls[0];
        assert!(call.id.starts_with("tool_"));
        assert_eq!(call.name, "execute_purchase");
        assert_eq!(
            call.arguments,
            json!({"ticker": "ACME", "quantity": 10, "maxPurchasePrice": 187.5})
        );
        assert_eq!(state.messages[2].tool_call_id.as_deref(), Some(call.id.as_str()));
        assert_eq!(state.messages[2].content, r#"{"success":true}"#);
        assert_eq!(
            state.messages[3].content,
            "Successfully purchased 10 share(s) of ACME at $187.5/share."
        );
    }

    #[test]
    fn whole_prices_print_without_decimals() {
        let details = PurchaseDetails {
            ticker: "ACME".into(),
            quantity: 1,
            max_purchase_price: 12.0,
        };
        assert_eq!(
            purchase_summary(&details),
            "Successfully purchased 1 share(s) of ACME at $12/share."
        );
    }

    #[tokio::test]
    async fn requires_pending_purchase() {
        let state = ConversationState::new(vec![ChatMessage::user("buy")]);
        let err = ExecutePurchaseNode.run(&state, &ctx()).await.unwrap_err();
        assert!(err.is_protocol());
    }
}
