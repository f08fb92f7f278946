use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use stockflow_core::approval::ApprovalDecision;
use stockflow_core::config::AppConfig;
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::event::EventBus;
use stockflow_core::traits::LlmClient;
use stockflow_core::types::{AgentEvent, ChatMessage, PurchaseDetails, RunId};
use stockflow_tools::{ToolRegistry, PURCHASE_STOCK};

use crate::checkpoint::CheckpointStore;
use crate::graph::{GraphExecutor, RunOutcome};
use crate::nodes::PURCHASE_APPROVAL;
use crate::state::{ConversationState, StateUpdate};
use crate::workflow::{broker_graph, Services};

const NOT_EXECUTED: &str =
    "This tool call was not executed because the purchase needed confirmation first.";

/// What a caller gets back from starting or resuming a broker run.
#[derive(Debug, Clone)]
pub enum RunResult {
    Completed {
        run_id: RunId,
        state: ConversationState,
    },
    /// Suspended at the approval gate; answer with `resume_run(token, ..)`.
    AwaitingApproval {
        run_id: RunId,
        token: String,
        pending_purchase: PurchaseDetails,
        prompt_for_user: String,
        state: ConversationState,
    },
}

impl RunResult {
    pub fn state(&self) -> &ConversationState {
        match self {
            RunResult::Completed { state, .. } | RunResult::AwaitingApproval { state, .. } => state,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            RunResult::Completed { run_id, .. } | RunResult::AwaitingApproval { run_id, .. } => {
                run_id
            }
        }
    }

    /// Text of the last assistant message.
    pub fn reply(&self) -> Option<&str> {
        self.state()
            .messages
            .iter()
            .rev()
            .find(|m| m.is_assistant() && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            RunResult::AwaitingApproval { token, .. } => Some(token),
            RunResult::Completed { .. } => None,
        }
    }
}

/// A suspended run as listed for the user.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub token: String,
    pub run_id: RunId,
    pub purchase: Option<PurchaseDetails>,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

/// Entry point for broker conversations: start a run, answer its approval
/// prompt, list what is waiting.
pub struct BrokerService {
    executor: GraphExecutor,
}

impl BrokerService {
    pub fn new(executor: GraphExecutor) -> Self {
        Self { executor }
    }

    /// Wire the broker workflow from configuration and injected handles.
    pub fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn CheckpointStore>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        let services = Services {
            llm,
            model: config.model.clone(),
            tools,
        };
        let graph = broker_graph(&services, config.graph.system_prompt.as_deref())?;
        let executor =
            GraphExecutor::new(graph, store, event_bus).with_max_steps(config.graph.max_steps);
        Ok(Self::new(executor))
    }

    pub fn executor(&self) -> &GraphExecutor {
        &self.executor
    }

    pub async fn start_run(&self, messages: Vec<ChatMessage>) -> Result<RunResult> {
        let outcome = self.executor.run(ConversationState::new(messages)).await?;
        into_result(outcome)
    }

    /// Answer a suspended purchase and continue the run.
    ///
    /// Other calls made alongside `purchase_stock` are answered as not
    /// executed, then the decision is recorded against the purchase call.
    pub async fn resume_run(&self, token: &str, decision: ApprovalDecision) -> Result<RunResult> {
        let approved = decision == ApprovalDecision::Approved;
        let outcome = self
            .executor
            .resume_with(token, |state| decision_update(state, &decision))
            .await?;

        info!(%token, approved, "Purchase decision recorded");
        self.executor
            .event_bus()
            .publish(AgentEvent::ApprovalResolved {
                token: token.to_string(),
                approved,
            });
        into_result(outcome)
    }

    /// Resume with an arbitrary update. An empty update suspends again.
    pub async fn resume_run_raw(&self, token: &str, update: StateUpdate) -> Result<RunResult> {
        into_result(self.executor.resume(token, update).await?)
    }

    /// Runs waiting for a decision, oldest first.
    pub fn pending(&self) -> Result<Vec<PendingApproval>> {
        Ok(self
            .executor
            .store()
            .list()?
            .into_iter()
            .map(|cp| PendingApproval {
                token: cp.token,
                run_id: cp.run_id,
                purchase: cp.state.pending_purchase,
                prompt: cp.reason,
                created_at: cp.created_at,
            })
            .collect())
    }

    pub fn find_by_prefix(&self, prefix: &str) -> Result<Option<String>> {
        self.executor.store().find_by_prefix(prefix)
    }
}

fn into_result(outcome: RunOutcome) -> Result<RunResult> {
    Ok(match outcome {
        RunOutcome::Completed { run_id, state, .. } => RunResult::Completed { run_id, state },
        RunOutcome::Interrupted {
            run_id,
            token,
            state,
            reason,
        } => {
            let pending_purchase = state.pending_purchase.clone().ok_or_else(|| {
                StockflowError::protocol(PURCHASE_APPROVAL, "suspended without a pending purchase")
            })?;
            RunResult::AwaitingApproval {
                run_id,
                token,
                pending_purchase,
                prompt_for_user: reason,
                state,
            }
        }
    })
}

/// Tool results closing out the suspended assistant message, decision last.
fn decision_update(state: &ConversationState, decision: &ApprovalDecision) -> Result<StateUpdate> {
    let message = state
        .last_assistant()
        .filter(|m| m.tool_call(PURCHASE_STOCK).is_some())
        .ok_or_else(|| {
            StockflowError::protocol(PURCHASE_APPROVAL, "suspended run has no purchase_stock call")
        })?;

    let mut update = StateUpdate::empty();
    let mut purchase_id = None;
    for call in &message.tool_calls {
        if state.is_answered(&call.id) {
            continue;
        }
        if call.name == PURCHASE_STOCK && purchase_id.is_none() {
            purchase_id = Some(call.id.clone());
        } else {
            update = update.with_message(ChatMessage::tool_result(call.id.clone(), NOT_EXECUTED));
        }
    }

    let purchase_id = purchase_id.ok_or_else(|| {
        StockflowError::protocol(PURCHASE_APPROVAL, "purchase_stock call is already answered")
    })?;
    Ok(update.with_message(ChatMessage::tool_result(
        purchase_id,
        decision.to_tool_content(),
    )))
}
