pub mod approval;
pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use approval::ApprovalDecision;
pub use config::AppConfig;
pub use error::{Result, StockflowError};
pub use event::EventBus;
pub use types::*;
