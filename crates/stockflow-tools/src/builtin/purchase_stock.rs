use serde_json::json;

use stockflow_core::types::ToolDefinition;

/// Name of the model-facing purchase tool.
pub const PURCHASE_STOCK: &str = "purchase_stock";

/// Schema the model sees for buying stock.
///
/// There is no executable tool behind it: a `purchase_stock` call is
/// routed to purchase preparation and human approval instead of the
/// tool dispatcher.
pub fn purchase_stock_definition() -> ToolDefinition {
    ToolDefinition {
        name: PURCHASE_STOCK.to_string(),
        description: "Use this tool to purchase a stock. Provide either the company ticker or \
                      the company name. The purchase is only executed after the user confirms it."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "ticker": {
                    "type": "string",
                    "description": "The ticker of the stock to purchase, e.g. AAPL"
                },
                "companyName": {
                    "type": "string",
                    "description": "The name of the company, used to look up the ticker when it is not known"
                },
                "quantity": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Number of shares to purchase (default 1)"
                },
                "maxPurchasePrice": {
                    "type": "number",
                    "description": "Maximum price per share. Defaults to the current market price"
                }
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_uses_camel_case_fields() {
        let def = purchase_stock_definition();
        assert_eq!(def.name, "purchase_stock");
        let props = &def.input_schema["properties"];
        assert!(props.get("companyName").is_some());
        assert!(props.get("maxPurchasePrice").is_some());
    }
}
