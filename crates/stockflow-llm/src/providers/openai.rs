use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stockflow_core::config::ModelConfig;
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::LlmClient;
use stockflow_core::types::*;

use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Serialize, Debug)]
pub(crate) struct OaiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiToolCall {
    #[serde(default)]
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<OaiFunction>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct OaiTool {
    r#type: &'static str,
    function: OaiToolDef,
}

#[derive(Serialize)]
pub(crate) struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDeltaContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaiToolCall>>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn convert_tools(tools: &[ToolDefinition]) -> Vec<OaiTool> {
    tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function",
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

pub(crate) fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|msg| match msg.role {
            Role::System | Role::User => OaiMessage {
                role: if msg.role == Role::System { "system" } else { "user" },
                content: Some(msg.content),
                tool_calls: None,
                tool_call_id: None,
            },
            Role::Tool => OaiMessage {
                role: "tool",
                content: Some(msg.content),
                tool_calls: None,
                tool_call_id: msg.tool_call_id,
            },
            Role::Assistant if msg.tool_calls.is_empty() => OaiMessage {
                role: "assistant",
                content: Some(msg.content),
                tool_calls: None,
                tool_call_id: None,
            },
            Role::Assistant => {
                let calls = msg
                    .tool_calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, tc)| OaiToolCall {
                        index: i,
                        id: Some(tc.id),
                        r#type: Some("function".to_string()),
                        function: Some(OaiFunction {
                            name: Some(tc.name),
                            arguments: Some(tc.arguments.to_string()),
                        }),
                    })
                    .collect();
                OaiMessage {
                    role: "assistant",
                    content: if msg.content.is_empty() {
                        None
                    } else {
                        Some(msg.content)
                    },
                    tool_calls: Some(calls),
                    tool_call_id: None,
                }
            }
        })
        .collect()
}

pub(crate) fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return vec![];
    }

    let chunk: StreamChunk = match serde_json::from_str(&event.data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            return vec![];
        }
    };

    let mut deltas = Vec::new();

    if let Some(usage) = chunk.usage {
        deltas.push(Ok(StreamDelta::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }));
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return deltas;
    };

    if let Some(text) = choice.delta.content {
        if !text.is_empty() {
            deltas.push(Ok(StreamDelta::TextDelta(text)));
        }
    }

    // Some providers send name and arguments in the same chunk
    if let Some(tool_calls) = choice.delta.tool_calls {
        for tc in tool_calls {
            let Some(func) = tc.function else { continue };
            if let Some(name) = func.name {
                deltas.push(Ok(StreamDelta::ToolUseStart {
                    index: tc.index,
                    id: tc.id.unwrap_or_default(),
                    name,
                }));
            }
            if let Some(args) = func.arguments {
                if !args.is_empty() {
                    deltas.push(Ok(StreamDelta::ToolInputDelta {
                        index: tc.index,
                        delta: args,
                    }));
                }
            }
        }
    }

    if let Some(reason) = choice.finish_reason {
        let stop = match reason.as_str() {
            "tool_calls" | "function_call" => StopReason::ToolUse,
            "length" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };
        deltas.push(Ok(StreamDelta::Stop(stop)));
    }

    deltas
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);

            let tool_choice = config.tool_choice.as_ref().map(|name| {
                serde_json::json!({ "type": "function", "function": { "name": name } })
            });

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages: convert_messages(messages),
                max_tokens: config.max_tokens,
                temperature: Some(config.temperature),
                stream: true,
                tools: convert_tools(&tools),
                tool_choice,
            };

            debug!(
                model = %config.model_id,
                messages = body.messages.len(),
                tools = body.tools.len(),
                "Sending chat completion request"
            );

            let mut req = self.http.post(base_url).json(&body);
            if let Some(api_key) = &config.api_key {
                req = req.bearer_auth(api_key);
            }

            let response = req
                .send()
                .await
                .map_err(|e| StockflowError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(StockflowError::LlmRequest(format!(
                    "HTTP {}: {}",
                    status, body
                )));
            }

            let sse_stream = SseStream::new(response.bytes_stream());
            let delta_stream = sse_stream
                .map(|event| match event {
                    Ok(event) => futures::stream::iter(parse_chunk(event)),
                    Err(e) => futures::stream::iter(vec![Err(e)]),
                })
                .flatten();

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}
