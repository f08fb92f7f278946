use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::types::{ChatMessage, PurchaseDetails, SearchResult};

/// The record every node reads and every update is merged into.
///
/// `messages` is append-merged. `pending_purchase` and `search_results`
/// are replace-merged through [`Overwrite`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_purchase: Option<PurchaseDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<Vec<SearchResult>>,
}

impl ConversationState {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// The last assistant message, if any.
    pub fn last_assistant(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.is_assistant())
    }

    /// Name of the tool call with `id`, searching every assistant message.
    pub fn tool_call_name(&self, id: &str) -> Option<&str> {
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .find(|tc| tc.id == id)
            .map(|tc| tc.name.as_str())
    }

    /// Whether some tool-result message answers the call `id`.
    pub fn is_answered(&self, id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.is_tool_result() && m.tool_call_id.as_deref() == Some(id))
    }

    /// Merge `update` into this state.
    ///
    /// The update is checked as a whole first, so a rejected update leaves
    /// the state untouched: every tool-result message must answer a call
    /// made earlier in the state or earlier in the same update.
    pub fn apply(&mut self, update: StateUpdate) -> Result<()> {
        let mut known: HashSet<&str> = self
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|tc| tc.id.as_str()))
            .collect();

        for msg in &update.messages {
            if msg.is_tool_result() {
                match msg.tool_call_id.as_deref() {
                    Some(id) if known.contains(id) => {}
                    Some(id) => {
                        return Err(StockflowError::protocol(
                            "merge",
                            format!("tool result references unknown tool call '{}'", id),
                        ))
                    }
                    None => {
                        return Err(StockflowError::protocol(
                            "merge",
                            "tool result without a tool_call_id",
                        ))
                    }
                }
            }
            known.extend(msg.tool_calls.iter().map(|tc| tc.id.as_str()));
        }

        self.messages.extend(update.messages);
        update.pending_purchase.apply_to(&mut self.pending_purchase);
        update.search_results.apply_to(&mut self.search_results);
        Ok(())
    }
}

/// Replace-merge instruction for an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Overwrite<T> {
    #[default]
    Unchanged,
    Set(T),
    Clear,
}

impl<T> Overwrite<T> {
    pub fn apply_to(self, slot: &mut Option<T>) {
        match self {
            Overwrite::Unchanged => {}
            Overwrite::Set(value) => *slot = Some(value),
            Overwrite::Clear => *slot = None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Overwrite::Unchanged)
    }
}

/// A node's partial state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<ChatMessage>,
    pub pending_purchase: Overwrite<PurchaseDetails>,
    pub search_results: Overwrite<Vec<SearchResult>>,
}

impl StateUpdate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn message(message: ChatMessage) -> Self {
        Self::messages(vec![message])
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_pending_purchase(mut self, details: PurchaseDetails) -> Self {
        self.pending_purchase = Overwrite::Set(details);
        self
    }

    pub fn clear_pending_purchase(mut self) -> Self {
        self.pending_purchase = Overwrite::Clear;
        self
    }

    pub fn with_search_results(mut self, results: Vec<SearchResult>) -> Self {
        self.search_results = Overwrite::Set(results);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.pending_purchase.is_unchanged()
            && self.search_results.is_unchanged()
    }
}
