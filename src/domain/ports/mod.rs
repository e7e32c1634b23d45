//! Domain ports (interfaces) for the Orra plan engine.

pub mod embedding;
pub mod plan_validator;
pub mod reasoning;
pub mod storage;
pub mod transport;

pub use embedding::{cosine_similarity, unit_normalize, EmbeddingClient, TrigramEmbeddingClient};
pub use plan_validator::{AcceptAllValidator, PlanValidator, ValidationReport};
pub use reasoning::{ReasoningClient, ScriptedReasoningClient};
pub use storage::{InMemoryStorage, Storage, StorageError};
pub use transport::{
    CompensationContext, InboundEnvelope, OutboundFrame, ServiceTransport, TaskResult,
    TransportError,
};
