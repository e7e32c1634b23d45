//! LLM provider adapters.
//!
//! Plan generation and embeddings both speak the OpenAI-compatible wire
//! shape, which also covers groq and self-hosted deployments via a base-URL
//! override.

mod openai;

pub use openai::{OpenAiEmbeddings, OpenAiLlmConfig, OpenAiReasoning};
