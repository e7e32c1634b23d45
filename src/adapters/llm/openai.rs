//! OpenAI-compatible chat-completions and embeddings clients.
//!
//! The reasoning client drives `/chat/completions`; the embedding client
//! drives `/embeddings` and unit-normalizes vectors so cosine similarity
//! reduces to a dot product. Compatible with any OpenAI-shaped API (groq,
//! local servers) via `base_url`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::config::{EmbeddingsConfig, ReasoningConfig};
use crate::domain::ports::embedding::{unit_normalize, EmbeddingClient};
use crate::domain::ports::reasoning::ReasoningClient;

/// Connection settings shared by both clients.
#[derive(Debug, Clone)]
pub struct OpenAiLlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl OpenAiLlmConfig {
    pub fn for_reasoning(config: &ReasoningConfig) -> Self {
        let base_url = config.api_base_url.clone().unwrap_or_else(|| {
            match config.provider.as_str() {
                "groq" => "https://api.groq.com/openai/v1".to_string(),
                _ => "https://api.openai.com/v1".to_string(),
            }
        });
        Self {
            api_key: config.api_key.clone(),
            base_url,
            model: config.model.clone(),
            timeout_secs: 120,
        }
    }

    pub fn for_embeddings(config: &EmbeddingsConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            base_url: config
                .api_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: config.model.clone(),
            timeout_secs: 30,
        }
    }

    fn api_key(&self) -> EngineResult<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                EngineError::Reasoning(
                    "API key not set. Configure api_key or set OPENAI_API_KEY.".to_string(),
                )
            })
    }

    fn build_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()
            .unwrap_or_default()
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Plan generation over `/chat/completions`.
pub struct OpenAiReasoning {
    config: OpenAiLlmConfig,
    client: reqwest::Client,
}

impl OpenAiReasoning {
    pub fn new(config: OpenAiLlmConfig) -> Self {
        let client = config.build_client();
        Self { config, client }
    }
}

#[async_trait]
impl ReasoningClient for OpenAiReasoning {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn generate(&self, prompt: &str) -> EngineResult<String> {
        let api_key = self.config.api_key()?;
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Reasoning(format!("generation request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Reasoning(format!(
                "generation API error {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Reasoning(format!("unparseable generation response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::Reasoning("generation returned no choices".into()))
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Embedding generation over `/embeddings`.
pub struct OpenAiEmbeddings {
    config: OpenAiLlmConfig,
    client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(config: OpenAiLlmConfig) -> Self {
        let client = config.build_client();
        Self { config, client }
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddings {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let api_key = self.config.api_key()?;
        let url = format!("{}/embeddings", self.config.base_url);
        let body = EmbeddingsRequest {
            model: self.config.model.clone(),
            input: vec![text.to_string()],
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Embedding(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!(
                "embedding API error {status}: {body}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Embedding(format!("unparseable embedding response: {e}")))?;
        let mut vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EngineError::Embedding("embedding returned no data".into()))?;
        unit_normalize(&mut vector);
        Ok(vector)
    }
}
