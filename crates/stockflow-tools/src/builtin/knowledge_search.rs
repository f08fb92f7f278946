use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::{Retriever, Tool};
use stockflow_core::types::{ToolContext, ToolResult};

const DEFAULT_LIMIT: usize = 5;

/// Semantic search over the knowledge base.
///
/// Output is `{"search_results": [...]}`, the shape `process_results` reads.
pub struct KnowledgeSearchTool {
    retriever: Arc<dyn Retriever>,
}

impl KnowledgeSearchTool {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }
}

impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn description(&self) -> &str {
        "Search the knowledge base for documents relevant to the question. Returns the closest matches with their distance scores."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural-language search query"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of results per collection (default 5)"
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
                .ok_or_else(|| {
                    StockflowError::ToolValidation("'query' must be a non-empty string".into())
                })?;
            let limit = input["limit"]
                .as_u64()
                .map(|l| l as usize)
                .unwrap_or(DEFAULT_LIMIT);

            let results = self.retriever.search(query, limit).await?;
            Ok(ToolResult::success(
                json!({ "search_results": results }).to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_test_utils::{sample_search_results, MockRetriever};

    #[tokio::test]
    async fn wraps_results_in_envelope() {
        let retriever = Arc::new(MockRetriever::new(sample_search_results()));
        let tool = KnowledgeSearchTool::new(retriever.clone());

        let result = tool
            .execute(json!({"query": "dividend policy", "limit": 3}), ToolContext::default())
            .await
            .unwrap();

        let body: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(body["search_results"][0]["collection_name"], "filings");
        assert_eq!(retriever.queries(), vec![("dividend policy".to_string(), 3)]);
    }

    #[tokio::test]
    async fn missing_query_is_rejected() {
        let tool = KnowledgeSearchTool::new(Arc::new(MockRetriever::new(vec![])));
        let err = tool
            .execute(json!({}), ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StockflowError::ToolValidation(_)));
    }
}
