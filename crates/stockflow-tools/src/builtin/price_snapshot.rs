use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use stockflow_core::error::Result;
use stockflow_core::traits::Tool;
use stockflow_core::types::{ToolContext, ToolResult};

use super::market_data::{ticker_arg, MarketDataClient};

/// Latest price snapshot for a ticker.
///
/// Returns the snapshot object, which carries at least `price`.
pub struct PriceSnapshotTool {
    client: Arc<MarketDataClient>,
}

impl PriceSnapshotTool {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self { client }
    }
}

/// Unwrap the `snapshot` envelope the API puts around the quote.
fn unwrap_snapshot(body: serde_json::Value) -> serde_json::Value {
    match body {
        serde_json::Value::Object(mut map) if map.contains_key("snapshot") => {
            map.remove("snapshot").unwrap_or_default()
        }
        other => other,
    }
}

impl Tool for PriceSnapshotTool {
    fn name(&self) -> &str {
        "price_snapshot"
    }

    fn description(&self) -> &str {
        "Get the current price snapshot for a stock. Requires the company ticker."
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
                .get_by_ticker(self.name(), "prices/snapshot", &ticker)
                .await?;
            Ok(ToolResult::success(unwrap_snapshot(body).to_string()))
        })
    }

    fn timeout_secs(&self) -> u64 {
        15
    }
}
