use futures::future::BoxFuture;
use serde_json::json;

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::Tool;
use stockflow_core::types::{ToolContext, ToolResult};

const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";

/// Web search backed by the Tavily API. Used by the agent for open questions
/// and by ticker resolution.
pub struct WebSearchTool {
    api_key: String,
    max_results: u64,
    endpoint: String,
    http: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            max_results: 5,
            endpoint: TAVILY_SEARCH_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_max_results(mut self, max_results: u64) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

fn exec_err(message: impl ToString) -> StockflowError {
    StockflowError::ToolExecution {
        tool: "web_search".into(),
        message: message.to_string(),
    }
}

/// Flatten a Tavily response into readable text for the model.
fn format_results(body: &serde_json::Value) -> String {
    let mut sections = Vec::new();

    if let Some(answer) = body["answer"].as_str().filter(|a| !a.is_empty()) {
        sections.push(answer.to_string());
    }

    if let Some(results) = body["results"].as_array() {
        sections.extend(results.iter().map(|r| {
            format!(
                "**{}**\n{}\nURL: {}",
                r["title"].as_str().unwrap_or(""),
                r["content"].as_str().unwrap_or(""),
                r["url"].as_str().unwrap_or("")
            )
        }));
    }

    if sections.is_empty() {
        "No results found.".into()
    } else {
        sections.join("\n\n---\n\n")
    }
}

impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information, such as a company's stock ticker or recent news."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results (default 5)"
                }
            },
            "required": ["query"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let query = input["query"]
                .as_str()
                .filter(|q| !q.trim().is_empty())
                .ok_or_else(|| StockflowError::ToolValidation("'query' must be a non-empty string".into()))?;
            let max = input["max_results"].as_u64().unwrap_or(self.max_results);

            let resp = self
                .http
                .post(&self.endpoint)
                .json(&json!({
                    "api_key": self.api_key,
                    "query": query,
                    "max_results": max,
                    "include_answer": true,
                }))
                .send()
                .await
                .map_err(exec_err)?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(exec_err(format!("HTTP {}: {}", status, text)));
            }

            let body: serde_json::Value = resp.json().await.map_err(exec_err)?;
            Ok(ToolResult::success(format_results(&body)))
        })
    }
}
