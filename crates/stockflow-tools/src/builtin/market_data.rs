use serde_json::Value;
use tracing::debug;

use stockflow_core::error::{Result, StockflowError};

/// Thin client for the Financial Datasets REST API, shared by the market tools.
pub struct MarketDataClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl MarketDataClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// GET `<base_url>/<path>/?ticker=<ticker>` and return the JSON body.
    ///
    /// `tool` names the calling tool in errors.
    pub async fn get_by_ticker(&self, tool: &str, path: &str, ticker: &str) -> Result<Value> {
        let url = format!("{}/{}/", self.base_url, path.trim_matches('/'));
        debug!(tool, %url, ticker, "Fetching market data");

        let exec_err = |message: String| StockflowError::ToolExecution {
            tool: tool.to_string(),
            message,
        };

        let resp = self
            .http
            .get(&url)
            .query(&[("ticker", ticker)])
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(|e| exec_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(exec_err(format!("HTTP {}: {}", status, text)));
        }

        resp.json().await.map_err(|e| exec_err(e.to_string()))
    }
}

/// Read and normalize the `ticker` argument shared by the market tools.
pub(crate) fn ticker_arg(input: &Value) -> Result<String> {
    input["ticker"]
        .as_str()
        .map(|t| t.trim().trim_start_matches('$').to_uppercase())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StockflowError::ToolValidation("'ticker' must be a non-empty string".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ticker_is_normalized() {
        assert_eq!(ticker_arg(&json!({"ticker": " $acme "})).unwrap(), "ACME");
    }

    #[test]
    fn missing_ticker_is_a_validation_error() {
        assert!(matches!(
            ticker_arg(&json!({})),
            Err(StockflowError::ToolValidation(_))
        ));
        assert!(ticker_arg(&json!({"ticker": ""})).is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let client = MarketDataClient::new("k", "https://api.example.com/");
        assert_eq!(client.base_url, "https://api.example.com");
    }
}
