//! Mocks and fixtures shared by the stockflow test suites.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{json, Value};

use stockflow_core::config::{AppConfig, ModelConfig};
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::{LlmClient, Retriever, Tool};
use stockflow_core::types::*;

// ── LLM ─────────────────────────────────────────────────────────

/// A request as seen by [`MockLlm`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<String>,
}

impl RecordedRequest {
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }
}

/// Scripted LLM: each call pops the next reply off the script.
///
/// Cloning shares the script and the request log.
#[derive(Clone, Default)]
pub struct MockLlm {
    script: Arc<Mutex<VecDeque<Result<Vec<StreamDelta>>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain text reply.
    pub fn with_text(self, text: &str) -> Self {
        self.push(Ok(text_reply(text)))
    }

    /// Queue a reply made of tool calls `(id, name, arguments)`.
    pub fn with_tool_calls(self, calls: &[(&str, &str, Value)]) -> Self {
        self.push(Ok(tool_call_reply("", calls)))
    }

    /// Queue a raw delta sequence.
    pub fn with_deltas(self, deltas: Vec<StreamDelta>) -> Self {
        self.push(Ok(deltas))
    }

    /// Queue a request failure.
    pub fn with_error(self, err: StockflowError) -> Self {
        self.push(Err(err))
    }

    fn push(self, reply: Result<Vec<StreamDelta>>) -> Self {
        self.script.lock().unwrap().push_back(reply);
        self
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

impl LlmClient for MockLlm {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages,
            tools: tools.to_vec(),
            tool_choice: config.tool_choice.clone(),
        });
        let next = self.script.lock().unwrap().pop_front();

        Box::pin(async move {
            let deltas = match next {
                Some(reply) => reply?,
                None => {
                    return Err(StockflowError::LlmRequest(
                        "MockLlm: no scripted reply left".into(),
                    ))
                }
            };
            let stream = futures::stream::iter(deltas.into_iter().map(Ok));
            Ok(Box::pin(stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// Deltas for a text-only reply, split into two chunks.
pub fn text_reply(text: &str) -> Vec<StreamDelta> {
    let mid = text
        .char_indices()
        .nth(text.chars().count() / 2)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let (a, b) = text.split_at(mid);
    let mut deltas: Vec<StreamDelta> = [a, b]
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| StreamDelta::TextDelta(s.to_string()))
        .collect();
    deltas.push(StreamDelta::Stop(StopReason::EndTurn));
    deltas
}

/// Deltas for a reply with optional text followed by tool calls.
///
/// Argument JSON is streamed in two pieces to exercise accumulation.
pub fn tool_call_reply(text: &str, calls: &[(&str, &str, Value)]) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    if !text.is_empty() {
        deltas.push(StreamDelta::TextDelta(text.to_string()));
    }
    for (index, (id, name, args)) in calls.iter().enumerate() {
        deltas.push(StreamDelta::ToolUseStart {
            index,
            id: id.to_string(),
            name: name.to_string(),
        });
        let raw = args.to_string();
        let mut mid = raw.len() / 2;
        while !raw.is_char_boundary(mid) {
            mid -= 1;
        }
        let (a, b) = raw.split_at(mid);
        for part in [a, b] {
            if !part.is_empty() {
                deltas.push(StreamDelta::ToolInputDelta {
                    index,
                    delta: part.to_string(),
                });
            }
        }
    }
    deltas.push(StreamDelta::Stop(StopReason::ToolUse));
    deltas.push(StreamDelta::Usage {
        input_tokens: 10,
        output_tokens: 5,
    });
    deltas
}

// ── Tools ───────────────────────────────────────────────────────

#[derive(Clone)]
enum StaticOutcome {
    Result(ToolResult),
    Fail(String),
}

/// Tool that always answers with the same output and records its inputs.
///
/// Cloning shares the call log, so keep a clone to inspect after registering.
#[derive(Clone)]
pub struct StaticTool {
    name: String,
    outcome: StaticOutcome,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl StaticTool {
    pub fn new(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: StaticOutcome::Result(ToolResult::success(content)),
            calls: Arc::default(),
        }
    }

    /// Tool whose result is flagged `is_error`.
    pub fn error_result(name: &str, content: &str) -> Self {
        Self {
            outcome: StaticOutcome::Result(ToolResult::error(content)),
            ..Self::new(name, "")
        }
    }

    /// Tool whose execution fails outright.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            outcome: StaticOutcome::Fail(message.to_string()),
            ..Self::new(name, "")
        }
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Static test tool"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn execute(&self, input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        self.calls.lock().unwrap().push(input);
        let outcome = self.outcome.clone();
        let name = self.name.clone();
        Box::pin(async move {
            match outcome {
                StaticOutcome::Result(result) => Ok(result),
                StaticOutcome::Fail(message) => Err(StockflowError::ToolExecution {
                    tool: name,
                    message,
                }),
            }
        })
    }
}

// ── Retriever ───────────────────────────────────────────────────

/// Retriever returning canned results and recording `(query, limit)` pairs.
#[derive(Clone)]
pub struct MockRetriever {
    results: Vec<SearchResult>,
    queries: Arc<Mutex<Vec<(String, usize)>>>,
}

impl MockRetriever {
    pub fn new(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            queries: Arc::default(),
        }
    }

    pub fn queries(&self) -> Vec<(String, usize)> {
        self.queries.lock().unwrap().clone()
    }
}

impl Retriever for MockRetriever {
    fn search(&self, query: &str, limit: usize) -> BoxFuture<'_, Result<Vec<SearchResult>>> {
        self.queries
            .lock()
            .unwrap()
            .push((query.to_string(), limit));
        let results = self.results.clone();
        Box::pin(async move { Ok(results) })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// One collection with two hits.
pub fn sample_search_results() -> Vec<SearchResult> {
    vec![SearchResult {
        collection_name: "filings".into(),
        results: vec![
            SearchHit {
                id: 1,
                distance: 0.12,
                content: "Acme Corp pays a quarterly dividend of $0.25 per share.".into(),
                metadata: json!({"source": "10-K"}),
            },
            SearchHit {
                id: 7,
                distance: 0.31,
                content: "Acme Corp announced a share buyback program.".into(),
                metadata: json!({"source": "8-K"}),
            },
        ],
    }]
}

/// Minimal config pointing at a throwaway model with no credentials.
pub fn test_config() -> AppConfig {
    toml::from_str(
        r#"
[model]
model_id = "test-model"

[graph]
max_steps = 25
workspace = "/tmp/stockflow-test"

[checkpoint]
enabled = false
"#,
    )
    .expect("test config parses")
}

/// A fresh temp dir and a database path inside it. Keep the dir alive for the test.
pub fn temp_db_path() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("runs.db");
    (dir, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn mock_llm_replays_script_in_order() {
        let llm = MockLlm::new().with_text("first").with_text("second");
        let config = ModelConfig::new("m");

        for expected in ["first", "second"] {
            let mut stream = llm
                .chat_stream(&config, vec![ChatMessage::user("hi")], &[])
                .await
                .unwrap();
            let mut text = String::new();
            while let Some(delta) = stream.next().await {
                if let StreamDelta::TextDelta(t) = delta.unwrap() {
                    text.push_str(&t);
                }
            }
            assert_eq!(text, expected);
        }
        assert_eq!(llm.call_count(), 2);
        assert!(llm
            .chat_stream(&config, vec![], &[])
            .await
            .is_err());
    }

    #[test]
    fn tool_call_reply_splits_arguments() {
        let deltas = tool_call_reply("", &[("c1", "web_search", json!({"query": "acme"}))]);
        let joined: String = deltas
            .iter()
            .filter_map(|d| match d {
                StreamDelta::ToolInputDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(joined, r#"{"query":"acme"}"#);
    }
}
