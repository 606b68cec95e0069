//! Vector store backends.
//!
//! Chunks live in a named collection. Two backends implement [`VectorStore`]:
//! - [`SqliteStore`]: a single SQLite file under the persist directory, with
//!   brute-force cosine ranking. Also available fully in memory.
//! - [`ChromaHttpStore`]: a remote Chroma server over its v2 REST API, used
//!   when `CHROMA_URL` is configured.

pub mod chroma;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::StoreError;

pub use chroma::ChromaHttpStore;
pub use sqlite::SqliteStore;

/// Chunk metadata (`act`, `scene`, `page_number`, ...), kept apart from the text.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A chunk ready to be written: text, metadata and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// A chunk read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Cosine distance to the query; `None` outside of queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

/// Summary of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    /// `None` when the backend could not count it.
    pub count: Option<usize>,
    pub metadata: Option<Metadata>,
}

/// Where chunks are stored and which collection is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the local database.
    pub persist_path: PathBuf,
    /// Active collection.
    pub collection_name: String,
    /// Remote Chroma server. When set, the local database is not used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub tenant: String,
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persist_path: PathBuf::from("/app/chroma_data"),
            collection_name: "rag_collection".to_string(),
            url: None,
            tenant: "default_tenant".to_string(),
            database: "default_database".to_string(),
        }
    }
}

impl StoreConfig {
    /// Human-readable location reported by `/health` and `/collections`.
    pub fn location(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => self.persist_path.display().to_string(),
        }
    }
}

/// A collection of embedded chunks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Name of the active collection.
    fn collection_name(&self) -> &str;

    /// Path, URL or `:memory:`.
    fn location(&self) -> String;

    /// Whether data survives a restart.
    fn is_persistent(&self) -> bool;

    /// Number of chunks in the active collection.
    async fn count(&self) -> Result<usize, StoreError>;

    /// The first `limit` chunks in insertion order.
    async fn peek(&self, limit: usize) -> Result<Vec<StoredChunk>, StoreError>;

    /// The `n_results` nearest chunks to `embedding`, nearest first.
    async fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
    ) -> Result<Vec<StoredChunk>, StoreError>;

    /// Insert or replace chunks by id. Returns how many were written.
    async fn add(&self, records: Vec<ChunkRecord>) -> Result<usize, StoreError>;

    /// Every collection the backend holds.
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, StoreError>;
}

/// Open the configured store, degrading instead of failing.
///
/// Tries the remote server (if `url` is set) or the persistent database,
/// then an in-memory database. Returns `None` when nothing could be opened.
pub async fn open_store(config: &StoreConfig) -> Option<Arc<dyn VectorStore>> {
    let primary: Result<Arc<dyn VectorStore>, StoreError> = match &config.url {
        Some(url) => ChromaHttpStore::connect(url, config)
            .await
            .map(|s| Arc::new(s) as Arc<dyn VectorStore>),
        None => {
            let dir = config.persist_path.clone();
            let name = config.collection_name.clone();
            match tokio::task::spawn_blocking(move || SqliteStore::open(&dir, &name)).await {
                Ok(result) => result.map(|s| Arc::new(s) as Arc<dyn VectorStore>),
                Err(e) => Err(StoreError::Backend {
                    message: format!("Task join error: {e}"),
                }),
            }
        }
    };

    match primary {
        Ok(store) => {
            info!(
                location = store.location().as_str(),
                collection = store.collection_name(),
                "Vector store ready"
            );
            return Some(store);
        }
        Err(e) => {
            error!(
                location = config.location().as_str(),
                error = %e,
                "Failed to open persistent store, falling back to in-memory"
            );
        }
    }

    match SqliteStore::in_memory(&config.collection_name) {
        Ok(store) => {
            warn!(
                collection = config.collection_name.as_str(),
                "Using in-memory store; data will not survive a restart"
            );
            Some(Arc::new(store))
        }
        Err(e) => {
            error!(error = %e, "In-memory store also failed, running without a store");
            None
        }
    }
}

/// Decode a JSON metadata string, treating null or non-objects as empty.
pub(crate) fn metadata_from_value(value: &serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map.clone(),
        _ => Metadata::new(),
    }
}
