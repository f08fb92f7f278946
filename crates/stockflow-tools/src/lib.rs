pub mod builtin;
pub mod registry;

pub use builtin::purchase_stock::{purchase_stock_definition, PURCHASE_STOCK};
pub use registry::ToolRegistry;
