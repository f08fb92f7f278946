use serde::{Deserialize, Serialize};
use serde_json::json;

/// A human decision on a pending purchase.
///
/// Recorded in the conversation as the tool result of the pending
/// `purchase_stock` call, using the same JSON shape the confirmation UI posts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected {
        #[serde(default)]
        reason: Option<String>,
    },
    Cancelled,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Tool-result body for this decision.
    pub fn to_tool_content(&self) -> String {
        let value = match self {
            Self::Approved => json!({ "approve": true }),
            Self::Rejected { reason: Some(reason) } => {
                json!({ "approve": false, "reason": reason })
            }
            Self::Rejected { reason: None } => json!({ "approve": false }),
            Self::Cancelled => json!({ "cancelled": true }),
        };
        value.to_string()
    }

    /// Parse a tool-result body. Returns `None` for anything that is not a decision.
    pub fn from_tool_content(content: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(content).ok()?;
        let obj = value.as_object()?;

        if obj.get("cancelled").and_then(|v| v.as_bool()) == Some(true) {
            return Some(Self::Cancelled);
        }
        match obj.get("approve").and_then(|v| v.as_bool()) {
            Some(true) => Some(Self::Approved),
            Some(false) => Some(Self::Rejected {
                reason: obj
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            }),
            None => None,
        }
    }
}
