//! # Folio Core
//!
//! Core library for Folio, a retrieval-augmented question answering service.
//! Provides configuration, embedders, vector stores, the Gemini provider,
//! the RAG service and its HTTP API.

pub mod artifacts;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod rag;
pub mod store;

// Re-export commonly used types at the crate root.
pub use artifacts::{ArtifactKind, ArtifactMatch, find_marker};
pub use config::{FolioConfig, LlmConfig, RagConfig, load_config};
pub use embeddings::{Embedder, EmbeddingConfig, LocalEmbedder, create_embedder};
pub use error::{ConfigError, FolioError, LlmError, QueryError, Result, StoreError};
pub use gateway::{ApiError, GatewayConfig, SharedService};
pub use providers::{GeminiProvider, GenerationRequest, LlmProvider, MockLlmProvider};
pub use rag::{
    CollectionsResponse, ContextWithMetadata, HealthResponse, IngestRecord, IngestReport,
    QueryRequest, QueryResponse, RagService, RagSettings,
};
pub use store::{
    ChromaHttpStore, ChunkRecord, Metadata, SqliteStore, StoreConfig, StoredChunk, VectorStore,
    open_store,
};
