use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A model-requested invocation of a named tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A chat message in the conversation.
///
/// `tool_calls` is only populated on assistant messages and `tool_call_id`
/// only on tool results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text)
    }

    pub fn assistant_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, text);
        msg.tool_calls = calls;
        msg
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// First tool call with the given name.
    pub fn tool_call(&self, name: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|tc| tc.name == name)
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition for sending to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Context passed to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub run_id: RunId,
}

impl ToolContext {
    pub fn for_run(run_id: &RunId) -> Self {
        Self {
            run_id: run_id.clone(),
        }
    }
}

/// A purchase waiting for human approval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseDetails {
    pub ticker: String,
    pub quantity: u32,
    pub max_purchase_price: f64,
}

/// One hit from the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub id: i64,
    pub distance: f64,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Hits grouped by the collection they came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub collection_name: String,
    #[serde(default)]
    pub results: Vec<SearchHit>,
}

/// Agent event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A run started from fresh input.
    RunStarted { run_id: RunId },
    /// A suspended run was resumed.
    RunResumed { run_id: RunId, token: String },
    /// A node is about to execute.
    NodeStarted { run_id: RunId, node: String },
    /// A node finished and its update was merged.
    NodeFinished {
        run_id: RunId,
        node: String,
        elapsed_ms: u64,
    },
    /// Text streaming from LLM.
    TextDelta(String),
    /// Tool execution started.
    ToolStart { name: String, input: serde_json::Value },
    /// Tool execution completed.
    ToolEnd { name: String, result: ToolResult },
    /// A run suspended waiting for a human decision.
    ApprovalRequested {
        run_id: RunId,
        token: String,
        purchase: Option<PurchaseDetails>,
    },
    /// A decision was supplied for a suspended run.
    ApprovalResolved { token: String, approved: bool },
    /// Run reached a terminal node.
    RunComplete { run_id: RunId, steps: usize },
    /// Run failed.
    RunError { run_id: RunId, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serializes_without_empty_fields() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn tool_result_carries_call_id() {
        let msg = ChatMessage::tool_result("call_1", "{}");
        assert!(msg.is_tool_result());
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn purchase_details_use_camel_case() {
        let details = PurchaseDetails {
            ticker: "ACME".into(),
            quantity: 10,
            max_purchase_price: 12.5,
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["maxPurchasePrice"], 12.5);
        let back: PurchaseDetails = serde_json::from_value(json).unwrap();
        assert_eq!(back, details);
    }

    #[test]
    fn tool_call_lookup_by_name() {
        let msg = ChatMessage::assistant_tool_calls(
            "",
            vec![
                ToolCall::new("a", "web_search", serde_json::json!({})),
                ToolCall::new("b", "purchase_stock", serde_json::json!({})),
            ],
        );
        assert_eq!(msg.tool_call("purchase_stock").map(|tc| tc.id.as_str()), Some("b"));
        assert!(msg.tool_call("missing").is_none());
    }
}
