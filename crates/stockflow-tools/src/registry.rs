use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use stockflow_core::config::AppConfig;
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::{Retriever, Tool};
use stockflow_core::types::{ToolContext, ToolDefinition, ToolResult};

use crate::builtin::market_data::MarketDataClient;
use crate::builtin::{CompanyFactsTool, KnowledgeSearchTool, PriceSnapshotTool, WebSearchTool};

/// Registry of available tools, dispatched by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Tool definitions for the model, sorted by name so requests are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name, bounded by the tool's timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| StockflowError::ToolNotFound(name.to_string()))?;

        let timeout_secs = tool.timeout_secs();
        debug!(tool = name, run_id = %ctx.run_id, timeout_secs, "Executing tool");

        match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            tool.execute(input, ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StockflowError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs,
            }),
        }
    }

    /// Registry with every built-in tool the config has credentials for.
    ///
    /// `knowledge_search` is registered only when a retriever is supplied.
    pub fn with_config(config: &AppConfig, retriever: Option<Arc<dyn Retriever>>) -> Self {
        let mut registry = Self::new();

        if let Some(ws) = &config.web_search {
            registry.register(WebSearchTool::new(&ws.api_key).with_max_results(ws.max_results));
        }

        if let Some(md) = &config.market_data {
            let client = Arc::new(MarketDataClient::new(&md.api_key, &md.base_url));
            registry.register(PriceSnapshotTool::new(client.clone()));
            registry.register(CompanyFactsTool::new(client));
        }

        if let Some(retriever) = retriever {
            registry.register(KnowledgeSearchTool::new(retriever));
        }

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use stockflow_test_utils::StaticTool;

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "never finishes in time"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<ToolResult>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(ToolResult::success("late"))
            })
        }
        fn timeout_secs(&self) -> u64 {
            1
        }
    }

    #[test]
    fn definitions_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticTool::new("web_search", "a"));
        registry.register(StaticTool::new("company_facts", "b"));
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["company_facts", "web_search"]);
        assert_eq!(registry.list(), vec!["company_facts", "web_search"]);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", json!({}), ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StockflowError::ToolNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticTool::new("web_search", "ACME is the ticker"));
        let result = registry
            .execute("web_search", json!({"query": "acme"}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result.content, "ACME is the ticker");
        assert!(!result.is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let err = registry
            .execute("slow", json!({}), ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StockflowError::ToolTimeout { timeout_secs: 1, .. }));
    }

    #[test]
    fn with_config_registers_credentialed_tools() {
        let config: AppConfig = toml::from_str(
            r#"
[model]
model_id = "gpt-4o"

[web_search]
api_key = "tv-key"

[market_data]
api_key = "fd-key"
"#,
        )
        .unwrap();
        let registry = ToolRegistry::with_config(&config, None);
        assert_eq!(
            registry.list(),
            vec!["company_facts", "price_snapshot", "web_search"]
        );
    }
}
