//! Error types for the Folio core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering the LLM provider, vector store, embedder, configuration, and
//! query-handling domains.

use std::path::PathBuf;

/// Top-level error type for the Folio core library.
#[derive(Debug, thiserror::Error)]
pub enum FolioError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Embedding error: {0}")]
    Embed(#[from] EmbedError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Provider unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Response blocked by provider: {reason}")]
    Blocked { reason: String },
}

/// Errors from the vector store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Vector store HTTP error: {message}")]
    Http { message: String },

    #[error("Vector store backend error: {message}")]
    Backend { message: String },

    #[error("Collection not found: {name}")]
    CollectionNotFound { name: String },

    #[error("Embedding dimension mismatch: collection uses {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from embedding providers.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("Failed to initialize embedding model '{model}': {message}")]
    Init { model: String, message: String },

    #[error("Embedding inference failed: {message}")]
    Inference { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

/// Failures of a `/query` request, each mapping to one HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Query cannot be empty.")]
    EmptyQuery,

    #[error("ChromaDB collection is unavailable.")]
    StoreUnavailable,

    #[error("ChromaDB retrieval failed: {0}")]
    Retrieval(String),

    #[error("Gemini Client is not initialized.")]
    LlmUnavailable,

    #[error("Gemini API call failed: {0}")]
    Generation(#[from] LlmError),
}

/// A type alias for results using the top-level `FolioError`.
pub type Result<T> = std::result::Result<T, FolioError>;
