//! Node implementations for the broker and knowledge-base workflows.

pub mod agent;
pub mod approval;
pub mod execute;
pub mod knowledge;
pub mod prepare;
pub mod tools;

pub use agent::{route_after_agent, AgentNode};
pub use approval::{route_after_approval, ApprovalGate};
pub use execute::ExecutePurchaseNode;
pub use knowledge::ProcessResultsNode;
pub use prepare::{route_after_prepare, PreparePurchaseNode, TickerResolver};
pub use tools::ToolDispatcher;

pub const AGENT: &str = "agent";
pub const TOOLS: &str = "tools";
pub const PREPARE_PURCHASE: &str = "prepare_purchase_details";
pub const PURCHASE_APPROVAL: &str = "purchase_approval";
pub const EXECUTE_PURCHASE: &str = "execute_purchase";
pub const PROCESS_RESULTS: &str = "process_results";
