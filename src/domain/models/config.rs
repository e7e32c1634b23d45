//! Engine configuration model.

use serde::{Deserialize, Serialize};

/// Main configuration for the plan engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Port the service transport listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the SQLite storage file.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// Reasoning model provider.
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Embedding model provider.
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,

    /// Optional path to the external PDDL validator binary.
    #[serde(default)]
    pub pddl_validator_path: Option<String>,

    /// PDDL validation timeout, milliseconds.
    #[serde(default = "default_pddl_timeout_ms")]
    pub pddl_validation_timeout_ms: u64,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

const fn default_port() -> u16 {
    8005
}

fn default_storage_path() -> String {
    ".orra/orra.db".to_string()
}

const fn default_pddl_timeout_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage_path: default_storage_path(),
            reasoning: ReasoningConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            pddl_validator_path: None,
            pddl_validation_timeout_ms: default_pddl_timeout_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Providers allowed for plan generation.
pub const REASONING_PROVIDERS: &[&str] = &["openai", "groq", "self-hosted"];

/// Models allowed for plan generation, per provider family.
pub const REASONING_MODELS: &[&str] = &[
    "o1-mini",
    "o3-mini",
    "deepseek-r1-distill-llama-70b",
    "qwen-qwq-32b",
    "custom",
];

/// Providers allowed for embeddings.
pub const EMBEDDING_PROVIDERS: &[&str] = &["openai", "self-hosted"];

/// Models allowed for embeddings.
pub const EMBEDDING_MODELS: &[&str] = &[
    "text-embedding-3-small",
    "text-embedding-3-large",
    "custom",
];

/// Reasoning (plan generation) provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReasoningConfig {
    #[serde(default = "default_reasoning_provider")]
    pub provider: String,
    #[serde(default = "default_reasoning_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override for self-hosted or compatible deployments.
    #[serde(default)]
    pub api_base_url: Option<String>,
}

fn default_reasoning_provider() -> String {
    "openai".to_string()
}

fn default_reasoning_model() -> String {
    "o3-mini".to_string()
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_reasoning_provider(),
            model: default_reasoning_model(),
            api_key: None,
            api_base_url: None,
        }
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EmbeddingsConfig {
    #[serde(default = "default_embeddings_provider")]
    pub provider: String,
    #[serde(default = "default_embeddings_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

fn default_embeddings_provider() -> String {
    "openai".to_string()
}

fn default_embeddings_model() -> String {
    "text-embedding-3-small".to_string()
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: default_embeddings_provider(),
            model: default_embeddings_model(),
            api_key: None,
            api_base_url: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
