pub mod company_facts;
pub mod knowledge_search;
pub mod market_data;
pub mod price_snapshot;
pub mod purchase_stock;
pub mod web_search;

pub use company_facts::CompanyFactsTool;
pub use knowledge_search::KnowledgeSearchTool;
pub use price_snapshot::PriceSnapshotTool;
pub use web_search::WebSearchTool;
