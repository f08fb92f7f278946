use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StockflowError};

/// Top-level stockflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
    #[serde(default)]
    pub market_data: Option<MarketDataConfig>,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Maximum node executions per run (or per resume).
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Replaces the built-in system instruction of the `agent` node.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            system_prompt: None,
            workspace: default_workspace(),
        }
    }
}

fn default_max_steps() -> usize { 25 }
fn default_workspace() -> String { "~/.stockflow".to_string() }

/// Suspended-run persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Persist suspended runs to SQLite (default: true). In-memory otherwise.
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// Database path. Default: <workspace>/runs.db
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn default_checkpoint_enabled() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Force the model to call the named tool on every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

impl ModelConfig {
    /// A config for `model_id` with every other field at its default.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: None,
            tool_choice: None,
        }
    }
}

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Web search provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default = "default_search_provider")]
    pub provider: String,
    pub api_key: String,
    #[serde(default = "default_search_results")]
    pub max_results: u64,
}

fn default_search_provider() -> String { "tavily".to_string() }
fn default_search_results() -> u64 { 5 }

/// Market data (price snapshots, company facts) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    pub api_key: String,
    #[serde(default = "default_market_data_url")]
    pub base_url: String,
}

fn default_market_data_url() -> String { "https://api.financialdatasets.ai".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StockflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StockflowError::Config(e.to_string()))
    }

    /// Build a minimal config from environment variables.
    ///
    /// Requires `OPENAI_API_KEY`; `STOCKFLOW_MODEL`, `TAVILY_API_KEY` and
    /// `FINANCIAL_DATASETS_API_KEY` are optional.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            StockflowError::Config("no config file and OPENAI_API_KEY is not set".into())
        })?;
        let model_id = std::env::var("STOCKFLOW_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        let mut model = ModelConfig::new(model_id);
        model.api_key = Some(api_key);

        Ok(Self {
            model,
            fallback_models: Vec::new(),
            graph: GraphConfig::default(),
            web_search: std::env::var("TAVILY_API_KEY").ok().map(|api_key| WebSearchConfig {
                provider: default_search_provider(),
                api_key,
                max_results: default_search_results(),
            }),
            market_data: std::env::var("FINANCIAL_DATASETS_API_KEY")
                .ok()
                .map(|api_key| MarketDataConfig {
                    api_key,
                    base_url: default_market_data_url(),
                }),
            checkpoint: CheckpointConfig::default(),
        })
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.graph.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Where suspended runs are stored.
    pub fn checkpoint_path(&self) -> PathBuf {
        match &self.checkpoint.path {
            Some(path) => PathBuf::from(path),
            None => self.workspace_dir().join("runs.db"),
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STOCKFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STOCKFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STOCKFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STOCKFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STOCKFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let toml_str = r#"
[model]
model_id = "gpt-4o"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.graph.max_steps, 25);
        assert!(config.graph.system_prompt.is_none());
        assert!(config.checkpoint.enabled);
        assert!(config.web_search.is_none());
        assert!(config.market_data.is_none());
    }

    #[test]
    fn test_checkpoint_path_defaults_to_workspace() {
        let toml_str = r#"
[model]
model_id = "gpt-4o"

[graph]
workspace = "/tmp/stockflow-ws"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("/tmp/stockflow-ws/runs.db")
        );
    }

    #[test]
    fn test_market_data_default_url() {
        let toml_str = r#"
[model]
model_id = "gpt-4o"

[market_data]
api_key = "fd-key"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let md = config.market_data.unwrap();
        assert_eq!(md.base_url, "https://api.financialdatasets.ai");
    }
}
