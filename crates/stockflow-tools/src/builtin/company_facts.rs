use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use stockflow_core::error::Result;
use stockflow_core::traits::Tool;
use stockflow_core::types::{ToolContext, ToolResult};

use super::market_data::{ticker_arg, MarketDataClient};

/// Company profile: name, sector, industry, exchange, market cap and so on.
pub struct CompanyFactsTool {
    client: Arc<MarketDataClient>,
}

impl CompanyFactsTool {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self { client }
    }
}

impl Tool for CompanyFactsTool {
    fn name(&self) -> &str {
        "company_facts"
    }

    fn description(&self) -> &str {
        "Get key facts about a company such as name, sector, industry and market cap. Requires the company ticker."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "ticker": {
                    "type": "string",
                    "description": "The ticker of the company, e.g. AAPL"
                }
            },
            "required": ["ticker"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let ticker = ticker_arg(&input)?;
            let body = self
                .client
                .get_by_ticker(self.name(), "company/facts", &ticker)
                .await?;
            let facts = body.get("company_facts").cloned().unwrap_or(body);
            Ok(ToolResult::success(facts.to_string()))
        })
    }

    fn timeout_secs(&self) -> u64 {
        15
    }
}
