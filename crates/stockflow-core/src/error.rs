use thiserror::Error;

#[derive(Debug, Error)]
pub enum StockflowError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Workflow errors
    #[error("Protocol error in {node}: {message}")]
    Protocol { node: String, message: String },

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Node '{node}' failed: {source}")]
    Node {
        node: String,
        #[source]
        source: Box<StockflowError>,
    },

    #[error("Unknown node '{node}' (routed from '{from}')")]
    UnknownNode { node: String, from: String },

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Run exceeded max steps ({0})")]
    MaxStepsExceeded(usize),

    #[error("No suspended run for token: {0}")]
    RunNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StockflowError {
    /// Shorthand for a protocol violation detected by `node`.
    pub fn protocol(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether this error (or the error it wraps) is a protocol violation.
    pub fn is_protocol(&self) -> bool {
        match self {
            Self::Protocol { .. } => true,
            Self::Node { source, .. } => source.is_protocol(),
            _ => false,
        }
    }

    /// Strip any `Node` wrappers and return the underlying error.
    pub fn root(&self) -> &StockflowError {
        match self {
            Self::Node { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StockflowError>;
