use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{debug, info};

use stockflow_core::config::ModelConfig;
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::traits::LlmClient;
use stockflow_core::types::{ChatMessage, PurchaseDetails, ToolCall, ToolContext, ToolDefinition};
use stockflow_tools::{ToolRegistry, PURCHASE_STOCK};

use super::{AGENT, PREPARE_PURCHASE, PURCHASE_APPROVAL};
use crate::graph::{Node, NodeOutput, Route, RunContext};
use crate::model;
use crate::state::{ConversationState, StateUpdate};

const WEB_SEARCH: &str = "web_search";
const PRICE_SNAPSHOT: &str = "price_snapshot";
const EXTRACT_TICKER: &str = "extract_ticker";

const MISSING_IDENTIFIER: &str =
    "Please provide either the company ticker or the company name to purchase stock.";

/// Arguments of a `purchase_stock` call as the model sends them.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseArgs {
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    quantity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    max_purchase_price: Option<f64>,
}

/// Accepts `10` as well as `"10"`; models quote numbers now and then.
fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Plain(f64),
        Quoted(String),
    }

    match Option::<Number>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Number::Plain(n)) => Ok(Some(n)),
        Some(Number::Quoted(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected a number, got {:?}", text))),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_args(call: &ToolCall) -> Result<PurchaseArgs> {
    if call.arguments.is_null() {
        return Ok(PurchaseArgs::default());
    }
    let mut args: PurchaseArgs = serde_json::from_value(call.arguments.clone()).map_err(|e| {
        StockflowError::protocol(
            PREPARE_PURCHASE,
            format!("malformed purchase_stock arguments: {}", e),
        )
    })?;
    args.ticker = non_blank(args.ticker);
    args.company_name = non_blank(args.company_name);
    Ok(args)
}

fn whole_quantity(quantity: Option<f64>) -> Result<u32> {
    match quantity {
        None => Ok(1),
        Some(q) if q.is_finite() && q >= 1.0 && q.fract() == 0.0 && q <= u32::MAX as f64 => {
            Ok(q as u32)
        }
        Some(q) => Err(StockflowError::protocol(
            PREPARE_PURCHASE,
            format!("quantity must be a positive whole number, got {}", q),
        )),
    }
}

/// Resolves company names to tickers: web search, then a forced
/// `extract_ticker` call on the search text.
///
/// Results are cached by normalized company name for the resolver's lifetime.
pub struct TickerResolver {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    tools: Arc<ToolRegistry>,
    pattern: Regex,
    cache: Mutex<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ExtractedTicker {
    ticker: String,
}

impl TickerResolver {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig, tools: Arc<ToolRegistry>) -> Result<Self> {
        if !tools.contains(WEB_SEARCH) {
            return Err(StockflowError::Config(format!(
                "ticker resolution needs the '{}' tool",
                WEB_SEARCH
            )));
        }
        // Exchange-qualified symbols such as 7203.T or BRK-B included
        let pattern = Regex::new(r"^[A-Z0-9][A-Z0-9.\-]{0,14}$")
            .map_err(|e| StockflowError::Config(e.to_string()))?;
        Ok(Self {
            llm,
            config,
            tools,
            pattern,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cache_key(company: &str) -> String {
        company
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// Trim, drop a leading `$`, uppercase, and check the shape: letters,
    /// digits, `.` and `-`, no whitespace.
    pub fn normalize(&self, raw: &str) -> Result<String> {
        let ticker = raw.trim().trim_start_matches('$').trim().to_uppercase();
        if self.pattern.is_match(&ticker) {
            Ok(ticker)
        } else {
            Err(StockflowError::LlmParse(format!(
                "'{}' is not a valid ticker symbol",
                raw
            )))
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    pub async fn resolve(&self, company: &str, ctx: &ToolContext) -> Result<String> {
        let key = Self::cache_key(company);
        if let Some(ticker) = self.cached(&key) {
            debug!(company, %ticker, "Ticker cache hit");
            return Ok(ticker);
        }

        let search = self
            .tools
            .execute(
                WEB_SEARCH,
                json!({ "query": format!("what is the stock symbol for {}?", company) }),
                ctx.clone(),
            )
            .await?;
        if search.is_error {
            return Err(StockflowError::ToolExecution {
                tool: WEB_SEARCH.into(),
                message: search.content,
            });
        }

        let schema = ToolDefinition {
            name: EXTRACT_TICKER.into(),
            description: "Record the stock ticker symbol found in the search result.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ticker": {
                        "type": "string",
                        "description": "The stock ticker symbol, e.g. AAPL"
                    }
                },
                "required": ["ticker"]
            }),
        };
        let prompt = format!(
            "Given the following search result, extract the ticker symbol for {}:\n{}",
            company, search.content
        );
        let extracted: ExtractedTicker =
            model::extract(self.llm.as_ref(), &self.config, schema, prompt).await?;
        let ticker = self.normalize(&extracted.ticker)?;

        info!(company, %ticker, "Resolved ticker");
        match self.cache.lock() {
            // First resolution wins, so concurrent lookups agree
            Ok(mut cache) => Ok(cache.entry(key).or_insert(ticker).clone()),
            Err(_) => Ok(ticker),
        }
    }
}

/// Validates the pending `purchase_stock` call and fills in what the model
/// left out: ticker (from the company name) and price (from a snapshot).
pub struct PreparePurchaseNode {
    resolver: TickerResolver,
    tools: Arc<ToolRegistry>,
}

impl PreparePurchaseNode {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        config: ModelConfig,
        tools: Arc<ToolRegistry>,
    ) -> Result<Self> {
        if !tools.contains(PRICE_SNAPSHOT) {
            return Err(StockflowError::Config(format!(
                "purchase preparation needs the '{}' tool",
                PRICE_SNAPSHOT
            )));
        }
        Ok(Self {
            resolver: TickerResolver::new(llm, config, tools.clone())?,
            tools,
        })
    }

    pub fn resolver(&self) -> &TickerResolver {
        &self.resolver
    }

    /// Ticker as given, or resolved from the company name.
    async fn ticker(
        &self,
        ticker: Option<String>,
        company: Option<String>,
        ctx: &ToolContext,
    ) -> Result<String> {
        match (ticker, company) {
            (Some(ticker), _) => self.resolver.normalize(&ticker).map_err(|_| {
                StockflowError::protocol(PREPARE_PURCHASE, format!("invalid ticker '{}'", ticker))
            }),
            (None, Some(company)) => self.resolver.resolve(&company, ctx).await,
            (None, None) => Err(StockflowError::MissingInput("ticker or companyName".into())),
        }
    }

    async fn current_price(&self, ticker: &str, ctx: &ToolContext) -> Result<f64> {
        let result = self
            .tools
            .execute(PRICE_SNAPSHOT, json!({ "ticker": ticker }), ctx.clone())
            .await?;
        let snapshot_err = |message: String| StockflowError::ToolExecution {
            tool: PRICE_SNAPSHOT.into(),
            message,
        };
        if result.is_error {
            return Err(snapshot_err(result.content));
        }

        let body: serde_json::Value = serde_json::from_str(&result.content)
            .map_err(|e| snapshot_err(format!("snapshot is not JSON: {}", e)))?;
        body.get("price")
            .or_else(|| body.get("snapshot").and_then(|s| s.get("price")))
            .and_then(|p| p.as_f64())
            .filter(|p| *p > 0.0)
            .ok_or_else(|| snapshot_err(format!("no price in snapshot for {}", ticker)))
    }
}

/// Follow-up asking the user for the missing identifier, answering every
/// call of the assistant message so the history stays well-formed.
fn missing_identifier_update(calls: &[ToolCall]) -> StateUpdate {
    let mut update = StateUpdate::empty();
    for call in calls {
        update = update.with_message(ChatMessage::tool_result(
            call.id.clone(),
            format!("Please provide the missing information for the {} tool.", call.name),
        ));
    }
    update
        .with_message(ChatMessage::assistant_text(MISSING_IDENTIFIER))
        .clear_pending_purchase()
}

impl Node for PreparePurchaseNode {
    fn run<'a>(
        &'a self,
        state: &'a ConversationState,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let last = state
                .last_message()
                .filter(|m| m.is_assistant())
                .ok_or_else(|| {
                    StockflowError::protocol(PREPARE_PURCHASE, "last message is not an assistant message")
                })?;
            let call = last.tool_call(PURCHASE_STOCK).ok_or_else(|| {
                StockflowError::protocol(PREPARE_PURCHASE, "no purchase_stock call to prepare")
            })?;
            let args = parse_args(call)?;
            let quantity = whole_quantity(args.quantity)?;
            let tool_ctx = ToolContext::for_run(&ctx.run_id);

            let ticker = match self.ticker(args.ticker, args.company_name, &tool_ctx).await {
                Err(StockflowError::MissingInput(what)) => {
                    info!(run_id = %ctx.run_id, missing = %what, "Purchase request incomplete");
                    return Ok(missing_identifier_update(&last.tool_calls).into());
                }
                other => other?,
            };

            let max_purchase_price = match args.max_purchase_price {
                Some(price) if price.is_finite() && price > 0.0 => price,
                Some(price) => {
                    return Err(StockflowError::protocol(
                        PREPARE_PURCHASE,
                        format!("maxPurchasePrice must be positive, got {}", price),
                    ))
                }
                None => self.current_price(&ticker, &tool_ctx).await?,
            };

            let details = PurchaseDetails {
                ticker,
                quantity,
                max_purchase_price,
            };
            info!(
                run_id = %ctx.run_id,
                ticker = %details.ticker,
                quantity = details.quantity,
                max_purchase_price = details.max_purchase_price,
                "Purchase prepared"
            );
            Ok(StateUpdate::empty().with_pending_purchase(details).into())
        })
    }
}

/// A prepared purchase goes to approval; anything else back to the model.
pub fn route_after_prepare(state: &ConversationState) -> Result<Route> {
    Ok(if state.pending_purchase.is_some() {
        Route::single(PURCHASE_APPROVAL)
    } else {
        Route::single(AGENT)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::event::EventBus;
    use stockflow_core::types::RunId;
    use stockflow_test_utils::{MockLlm, StaticTool};

    struct Fixture {
        llm: MockLlm,
        search: StaticTool,
        price: StaticTool,
        node: PreparePurchaseNode,
    }

    fn fixture(llm: MockLlm) -> Fixture {
        let search = StaticTool::new("web_search", "Acme Corp (NYSE: ACME) is a maker of anvils.");
        let price = StaticTool::new("price_snapshot", r#"{"ticker":"ACME","price":187.5}"#);
        let mut registry = ToolRegistry::new();
        registry.register(search.clone());
        registry.register(price.clone());
        let node = PreparePurchaseNode::new(
            Arc::new(llm.clone()),
            ModelConfig::new("m"),
            Arc::new(registry),
        )
        .unwrap();
        Fixture {
            llm,
            search,
            price,
            node,
        }
    }

    fn ctx() -> RunContext {
        RunContext {
            run_id: RunId::new(),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    fn purchase_call(args: serde_json::Value) -> ConversationState {
        ConversationState::new(vec![
            ChatMessage::user("buy"),
            ChatMessage::assistant_tool_calls("", vec![ToolCall::new("p1", "purchase_stock", args)]),
        ])
    }

    async fn prepare(f: &Fixture, state: &ConversationState) -> Result<StateUpdate> {
        match f.node.run(state, &ctx()).await? {
            NodeOutput::Update(u) => Ok(u),
            NodeOutput::Interrupt { .. } => panic!("prepare never interrupts"),
        }
    }

    #[tokio::test]
    async fn complete_arguments_need_no_lookups() {
        let f = fixture(MockLlm::new());
        let state = purchase_call(json!({"ticker": "$acme", "quantity": 3, "maxPurchasePrice": 20.0}));
        let up = prepare(&f, &state).await.unwrap();

        let mut merged = state.clone();
        merged.apply(up).unwrap();
        assert_eq!(
            merged.pending_purchase,
            Some(PurchaseDetails {
                ticker: "ACME".into(),
                quantity: 3,
                max_purchase_price: 20.0
            })
        );
        assert!(f.search.calls().is_empty());
        assert!(f.price.calls().is_empty());
        assert_eq!(f.llm.call_count(), 0);
        assert_eq!(route_after_prepare(&merged).unwrap(), Route::single(PURCHASE_APPROVAL));
    }

    #[tokio::test]
    async fn missing_price_uses_snapshot_and_quantity_defaults() {
        let f = fixture(MockLlm::new());
        let state = purchase_call(json!({"ticker": "ACME"}));
        let up = prepare(&f, &state).await.unwrap();
        match up.pending_purchase {
            crate::state::Overwrite::Set(d) => {
                assert_eq!(d.quantity, 1);
                assert_eq!(d.max_purchase_price, 187.5);
            }
            other => panic!("expected Set, got {:?}", other),
        }
        assert_eq!(f.price.calls(), vec![json!({"ticker": "ACME"})]);
    }

    #[tokio::test]
    async fn missing_identifier_asks_the_user() {
        let f = fixture(MockLlm::new());
        let mut state = purchase_call(json!({"ticker": "", "quantity": 5}));
        // A stale purchase from earlier must not survive
        state.pending_purchase = Some(PurchaseDetails {
            ticker: "OLD".into(),
            quantity: 1,
            max_purchase_price: 1.0,
        });

        let up = prepare(&f, &state).await.unwrap();
        state.apply(up).unwrap();

        assert!(state.pending_purchase.is_none());
        let n = state.messages.len();
        assert_eq!(state.messages[n - 2].tool_call_id.as_deref(), Some("p1"));
        assert_eq!(
            state.messages[n - 2].content,
            "Please provide the missing information for the purchase_stock tool."
        );
        assert_eq!(state.messages[n - 1].content, MISSING_IDENTIFIER);
        assert_eq!(route_after_prepare(&state).unwrap(), Route::single(AGENT));
    }

    #[tokio::test]
    async fn company_name_is_resolved_once() {
        let llm = MockLlm::new().with_tool_calls(&[("x1", "extract_ticker", json!({"ticker": " $acme "}))]);
        let f = fixture(llm);

        let state = purchase_call(json!({"companyName": "Acme Corp", "quantity": 10}));
        let first = prepare(&f, &state).await.unwrap();
        let state_again = purchase_call(json!({"companyName": "  acme   corp", "quantity": 10}));
        let second = prepare(&f, &state_again).await.unwrap();

        let ticker = |u: StateUpdate| match u.pending_purchase {
            crate::state::Overwrite::Set(d) => d.ticker,
            other => panic!("expected Set, got {:?}", other),
        };
        assert_eq!(ticker(first), "ACME");
        assert_eq!(ticker(second), "ACME");
        assert_eq!(f.llm.call_count(), 1, "second lookup is served from cache");
        assert_eq!(
            f.search.calls(),
            vec![json!({"query": "what is the stock symbol for Acme Corp?"})]
        );

        let req = &f.llm.requests()[0];
        assert_eq!(req.tool_choice.as_deref(), Some("extract_ticker"));
        assert!(req.messages[0]
            .content
            .starts_with("Given the following search result, extract the ticker symbol for Acme Corp:\n"));
    }

    #[tokio::test]
    async fn digit_leading_tickers_are_accepted() {
        let f = fixture(MockLlm::new());
        let state = purchase_call(json!({"ticker": "7203.t", "quantity": "100", "maxPurchasePrice": "2500.5"}));
        let up = prepare(&f, &state).await.unwrap();
        match up.pending_purchase {
            crate::state::Overwrite::Set(d) => {
                assert_eq!(d.ticker, "7203.T");
                assert_eq!(d.quantity, 100);
                assert_eq!(d.max_purchase_price, 2500.5);
            }
            other => panic!("expected Set, got {:?}", other),
        }

        let llm = MockLlm::new().with_tool_calls(&[("x1", "extract_ticker", json!({"ticker": "0700.HK"}))]);
        let f = fixture(llm);
        let state = purchase_call(json!({"companyName": "Tencent", "maxPurchasePrice": 300.0}));
        let up = prepare(&f, &state).await.unwrap();
        match up.pending_purchase {
            crate::state::Overwrite::Set(d) => assert_eq!(d.ticker, "0700.HK"),
            other => panic!("expected Set, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn implausible_ticker_fails_the_node() {
        let llm = MockLlm::new().with_tool_calls(&[("x1", "extract_ticker", json!({"ticker": "not a ticker"}))]);
        let f = fixture(llm);
        let state = purchase_call(json!({"companyName": "Acme Corp"}));
        let err = prepare(&f, &state).await.unwrap_err();
        assert!(matches!(err, StockflowError::LlmParse(_)));
    }

    #[tokio::test]
    async fn malformed_arguments_are_protocol_errors() {
        let f = fixture(MockLlm::new());
        for args in [
            json!({"ticker": "ACME", "quantity": "ten"}),
            json!({"ticker": "ACME", "quantity": 2.5}),
            json!({"ticker": "ACME", "quantity": 0}),
            json!({"ticker": "ACME", "quantity": "2.5"}),
            json!("ACME"),
        ] {
            let err = prepare(&f, &purchase_call(args.clone())).await.unwrap_err();
            assert!(err.is_protocol(), "expected protocol error for {}", args);
        }
    }

    #[test]
    fn requires_market_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticTool::new("web_search", ""));
        let result = PreparePurchaseNode::new(
            Arc::new(MockLlm::new()),
            ModelConfig::new("m"),
            Arc::new(registry),
        );
        assert!(matches!(result, Err(StockflowError::Config(_))));
    }
}
