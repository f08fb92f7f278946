use futures::StreamExt;
use serde::de::DeserializeOwned;
use tracing::debug;

use stockflow_core::config::ModelConfig;
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::event::EventBus;
use stockflow_core::traits::LlmClient;
use stockflow_core::types::{AgentEvent, ChatMessage, StreamDelta, ToolCall, ToolDefinition};

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// Send one request and fold the streamed reply into an assistant message.
///
/// Text deltas are forwarded to `events` as they arrive. Tool-call input that
/// is not valid JSON fails with `LlmParse`; an empty input counts as `{}`.
pub async fn complete(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
    tools: &[ToolDefinition],
    events: Option<&EventBus>,
) -> Result<ChatMessage> {
    let mut stream = llm.chat_stream(config, messages, tools).await?;

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();
    let mut usage = (0u64, 0u64);

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(chunk) => {
                if let Some(bus) = events {
                    bus.publish(AgentEvent::TextDelta(chunk.clone()));
                }
                text.push_str(&chunk);
            }
            StreamDelta::ToolUseStart { index, id, name } => {
                while tool_calls.len() <= index {
                    tool_calls.push(ToolCallAccumulator::default());
                }
                tool_calls[index].id = id;
                tool_calls[index].name = name;
            }
            StreamDelta::ToolInputDelta { index, delta } => {
                if let Some(tc) = tool_calls.get_mut(index) {
                    tc.input_json.push_str(&delta);
                }
            }
            StreamDelta::Stop(_) => {}
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                usage.0 += input_tokens;
                usage.1 += output_tokens;
            }
        }
    }

    debug!(
        model = %config.model_id,
        input_tokens = usage.0,
        output_tokens = usage.1,
        tool_calls = tool_calls.len(),
        "Model reply received"
    );

    let calls = tool_calls
        .into_iter()
        .filter(|tc| !tc.name.is_empty() || !tc.input_json.is_empty())
        .map(finish_call)
        .collect::<Result<Vec<_>>>()?;

    Ok(ChatMessage::assistant_tool_calls(text, calls))
}

fn finish_call(tc: ToolCallAccumulator) -> Result<ToolCall> {
    if tc.name.is_empty() {
        return Err(StockflowError::LlmParse(
            "tool call arguments arrived without a tool name".into(),
        ));
    }
    let arguments = if tc.input_json.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(&tc.input_json).map_err(|e| {
            StockflowError::LlmParse(format!("invalid arguments for '{}': {}", tc.name, e))
        })?
    };
    // Some OpenAI-compatible servers omit call ids
    let id = if tc.id.is_empty() {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    } else {
        tc.id
    };
    Ok(ToolCall::new(id, tc.name, arguments))
}

/// Ask the model to fill `schema` and decode the arguments it supplies.
///
/// The request carries only that schema and forces the model to call it.
pub async fn extract<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    schema: ToolDefinition,
    prompt: String,
) -> Result<T> {
    let mut forced = config.clone();
    forced.tool_choice = Some(schema.name.clone());

    let reply = complete(
        llm,
        &forced,
        vec![ChatMessage::user(prompt)],
        std::slice::from_ref(&schema),
        None,
    )
    .await?;

    let call = reply.tool_call(&schema.name).ok_or_else(|| {
        StockflowError::LlmParse(format!("model did not call '{}'", schema.name))
    })?;
    serde_json::from_value(call.arguments.clone()).map_err(|e| {
        StockflowError::LlmParse(format!("'{}' arguments did not match: {}", schema.name, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use stockflow_test_utils::{tool_call_reply, MockLlm};

    #[tokio::test]
    async fn folds_text_and_tool_calls() {
        let llm = MockLlm::new().with_deltas(tool_call_reply(
            "Looking that up.",
            &[
                ("c1", "web_search", json!({"query": "acme ticker"})),
                ("c2", "company_facts", json!({"ticker": "ACME"})),
            ],
        ));
        let msg = complete(&llm, &ModelConfig::new("m"), vec![ChatMessage::user("hi")], &[], None)
            .await
            .unwrap();

        assert!(msg.is_assistant());
        assert_eq!(msg.content, "Looking that up.");
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].id, "c1");
        assert_eq!(msg.tool_calls[0].arguments, json!({"query": "acme ticker"}));
        assert_eq!(msg.tool_calls[1].name, "company_facts");
    }

    #[tokio::test]
    async fn broken_arguments_are_a_parse_error() {
        let llm = MockLlm::new().with_deltas(vec![
            StreamDelta::ToolUseStart {
                index: 0,
                id: "c1".into(),
                name: "web_search".into(),
            },
            StreamDelta::ToolInputDelta {
                index: 0,
                delta: "{\"query\": ".into(),
            },
        ]);
        let err = complete(&llm, &ModelConfig::new("m"), vec![ChatMessage::user("hi")], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, StockflowError::LlmParse(_)));
    }

    #[tokio::test]
    async fn text_is_forwarded_to_the_event_bus() {
        let llm = MockLlm::new().with_text("hello there");
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        complete(&llm, &ModelConfig::new("m"), vec![ChatMessage::user("hi")], &[], Some(&bus))
            .await
            .unwrap();

        let mut streamed = String::new();
        while let Ok(AgentEvent::TextDelta(t)) = rx.try_recv() {
            streamed.push_str(&t);
        }
        assert_eq!(streamed, "hello there");
    }

    #[derive(Debug, Deserialize)]
    struct Ticker {
        ticker: String,
    }

    #[tokio::test]
    async fn extract_forces_the_schema() {
        let llm = MockLlm::new().with_tool_calls(&[("x1", "extract_ticker", json!({"ticker": "ACME"}))]);
        let schema = ToolDefinition {
            name: "extract_ticker".into(),
            description: "Ticker".into(),
            input_schema: json!({"type": "object"}),
        };
        let got: Ticker = extract(&llm, &ModelConfig::new("m"), schema, "find it".into())
            .await
            .unwrap();
        assert_eq!(got.ticker, "ACME");

        let req = &llm.requests()[0];
        assert_eq!(req.tool_choice.as_deref(), Some("extract_ticker"));
        assert_eq!(req.tool_names(), vec!["extract_ticker"]);
        assert_eq!(req.messages.len(), 1);
    }

    #[tokio::test]
    async fn extract_without_call_fails() {
        let llm = MockLlm::new().with_text("ACME");
        let schema = ToolDefinition {
            name: "extract_ticker".into(),
            description: "Ticker".into(),
            input_schema: json!({"type": "object"}),
        };
        let err = extract::<Ticker>(&llm, &ModelConfig::new("m"), schema, "find it".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StockflowError::LlmParse(_)));
    }
}
