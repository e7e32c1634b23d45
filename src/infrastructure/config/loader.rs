use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::{
    Config, EMBEDDING_MODELS, EMBEDDING_PROVIDERS, REASONING_MODELS, REASONING_PROVIDERS,
};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid reasoning provider: {0}. Must be one of: openai, groq, self-hosted")]
    InvalidReasoningProvider(String),

    #[error("Invalid reasoning model: {0}")]
    InvalidReasoningModel(String),

    #[error("Invalid embeddings provider: {0}. Must be one of: openai, self-hosted")]
    InvalidEmbeddingsProvider(String),

    #[error("Invalid embeddings model: {0}")]
    InvalidEmbeddingsModel(String),

    #[error("A self-hosted provider requires api_base_url")]
    MissingBaseUrl,

    #[error("Storage path cannot be empty")]
    EmptyStoragePath,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid PDDL validation timeout: {0} ms. Must be positive")]
    InvalidPddlTimeout(u64),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. orra.yaml in the working directory
    /// 3. Environment variables (ORRA_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("orra.yaml"))
            .merge(Env::prefixed("ORRA_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("ORRA_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if !REASONING_PROVIDERS.contains(&config.reasoning.provider.as_str()) {
            return Err(ConfigError::InvalidReasoningProvider(
                config.reasoning.provider.clone(),
            ));
        }
        if !REASONING_MODELS.contains(&config.reasoning.model.as_str()) {
            return Err(ConfigError::InvalidReasoningModel(
                config.reasoning.model.clone(),
            ));
        }
        if config.reasoning.provider == "self-hosted" && config.reasoning.api_base_url.is_none() {
            return Err(ConfigError::MissingBaseUrl);
        }

        if !EMBEDDING_PROVIDERS.contains(&config.embeddings.provider.as_str()) {
            return Err(ConfigError::InvalidEmbeddingsProvider(
                config.embeddings.provider.clone(),
            ));
        }
        if !EMBEDDING_MODELS.contains(&config.embeddings.model.as_str()) {
            return Err(ConfigError::InvalidEmbeddingsModel(
                config.embeddings.model.clone(),
            ));
        }
        if config.embeddings.provider == "self-hosted" && config.embeddings.api_base_url.is_none() {
            return Err(ConfigError::MissingBaseUrl);
        }

        if config.storage_path.is_empty() {
            return Err(ConfigError::EmptyStoragePath);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.pddl_validation_timeout_ms == 0 {
            return Err(ConfigError::InvalidPddlTimeout(
                config.pddl_validation_timeout_ms,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ConfigLoader::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_invalid_reasoning_provider() {
        let mut config = Config::default();
        config.reasoning.provider = "anthropic".into();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidReasoningProvider(_))
        ));
    }

    #[test]
    fn test_self_hosted_requires_base_url() {
        let mut config = Config::default();
        config.reasoning.provider = "self-hosted".into();
        config.reasoning.model = "custom".into();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MissingBaseUrl)
        ));
        config.reasoning.api_base_url = Some("http://localhost:9009/v1".into());
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }
}
