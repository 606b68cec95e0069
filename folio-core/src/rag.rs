//! The retrieval-augmented answering service.
//!
//! [`RagService`] ties the three external pieces together: the embedder turns
//! a question into a vector, the vector store returns the nearest chunks, and
//! the LLM answers from those chunks only. Store and LLM are optional so the
//! service can start (and report its state through `/health`) when either is
//! missing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::FolioConfig;
use crate::embeddings::{Embedder, LocalEmbedder, create_embedder};
use crate::error::{EmbedError, FolioError, QueryError, StoreError};
use crate::providers::{GeminiProvider, GenerationRequest, LlmProvider};
use crate::store::{ChunkRecord, Metadata, StoredChunk, VectorStore, open_store};

/// Answer returned when retrieval finds nothing.
pub const NO_CONTEXT_ANSWER: &str =
    "I could not find any relevant information in the knowledge base.";

/// Separator placed between context chunks in the prompt.
pub const CONTEXT_SEPARATOR: &str = "\n---\n";

/// Body of `POST /query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub user_query: String,
}

/// A retrieved chunk with its act/scene/page metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextWithMetadata {
    pub text: String,
    pub metadata: Metadata,
}

/// Response of `POST /query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    /// Retrieved chunk texts, nearest first.
    pub contexts: Vec<String>,
    #[serde(default)]
    pub contexts_with_metadata: Vec<ContextWithMetadata>,
}

impl QueryResponse {
    fn no_context() -> Self {
        Self {
            answer: NO_CONTEXT_ANSWER.to_string(),
            contexts: Vec::new(),
            contexts_with_metadata: Vec::new(),
        }
    }
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub details: HealthDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDetails {
    pub chroma_present: bool,
    pub chroma_path: String,
    pub collection_name: String,
    /// `None` when the store failed to count.
    pub collection_count: Option<usize>,
    pub gemini_initialized: bool,
    pub gemini_model: String,
    pub top_k: usize,
    pub embed_model: String,
    pub sample_chunk_preview: Option<String>,
    pub sample_metadata: Option<Metadata>,
}

/// Response of `GET /collections`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionsResponse {
    pub collections: Vec<CollectionEntry>,
    pub active_collection: String,
    pub database_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub name: String,
    pub count: Option<usize>,
    pub metadata: Option<Metadata>,
    pub is_active: bool,
}

/// One pre-cleaned chunk to load, as read from a JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Outcome of [`RagService::ingest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub added: usize,
    /// Records with blank text.
    pub skipped: usize,
    pub batches: usize,
}

/// Non-component settings of the service.
#[derive(Debug, Clone)]
pub struct RagSettings {
    pub collection_name: String,
    /// Reported as `chroma_path` / `database_path`.
    pub store_location: String,
    pub top_k: usize,
    pub preview_chars: usize,
    pub system_instruction: String,
    pub gemini_model: String,
    pub batch_size: usize,
}

impl RagSettings {
    pub fn from_config(config: &FolioConfig) -> Self {
        Self {
            collection_name: config.store.collection_name.clone(),
            store_location: config.store.location(),
            top_k: config.rag.top_k,
            preview_chars: config.rag.preview_chars,
            system_instruction: config.llm.system_instruction.clone(),
            gemini_model: config.llm.model.clone(),
            batch_size: config.embedding.batch_size.max(1),
        }
    }
}

impl Default for RagSettings {
    fn default() -> Self {
        Self::from_config(&FolioConfig::default())
    }
}

/// Assemble the grounded prompt sent to the LLM.
pub fn build_prompt(user_query: &str, contexts: &[String]) -> String {
    let context = contexts.join(CONTEXT_SEPARATOR);
    format!(
        "You are a helpful assistant. Use ONLY the information provided in the context below to answer the user's query.\n\n\
         Context:\n{context}\n\n\
         User Query:\n{user_query}\n\n\
         Answer:"
    )
}

/// The RAG service shared by all HTTP handlers.
pub struct RagService {
    store: Option<Arc<dyn VectorStore>>,
    embedder: Arc<dyn Embedder>,
    llm: Option<Arc<dyn LlmProvider>>,
    settings: RagSettings,
}

impl RagService {
    pub fn new(
        store: Option<Arc<dyn VectorStore>>,
        embedder: Arc<dyn Embedder>,
        llm: Option<Arc<dyn LlmProvider>>,
        settings: RagSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            settings,
        }
    }

    /// Build every component from configuration.
    ///
    /// Components that fail to start are logged and left out: no store means
    /// `/query` answers 503, no LLM means 500.
    pub async fn from_config(config: &FolioConfig) -> Self {
        let store = open_store(&config.store).await;

        let embedding = config.embedding.clone();
        let loaded = tokio::task::spawn_blocking(move || create_embedder(&embedding)).await;
        let embedder: Arc<dyn Embedder> = match loaded {
            Ok(embedder) => embedder,
            Err(e) => {
                warn!(error = %e, "Embedder initialization panicked, using local embedder");
                Arc::new(LocalEmbedder::new(config.embedding.dimensions))
            }
        };

        let llm: Option<Arc<dyn LlmProvider>> = match GeminiProvider::new(&config.llm) {
            Ok(provider) => {
                info!(model = config.llm.model.as_str(), "Gemini client initialized");
                Some(Arc::new(provider))
            }
            Err(e) => {
                warn!(error = %e, "Failed to initialize Gemini client");
                None
            }
        };

        Self::new(store, embedder, llm, RagSettings::from_config(config))
    }

    pub fn settings(&self) -> &RagSettings {
        &self.settings
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Embed `text` on the blocking pool.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let embedder = Arc::clone(&self.embedder);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| EmbedError::Inference {
                message: format!("Task join error: {e}"),
            })?
    }

    /// The `top_k` chunks nearest to `user_query`.
    pub async fn retrieve(
        &self,
        store: &dyn VectorStore,
        user_query: &str,
    ) -> Result<Vec<StoredChunk>, FolioError> {
        let embedding = self.embed_query(user_query).await?;
        let hits = store.query(&embedding, self.settings.top_k).await?;
        debug!(hits = hits.len(), top_k = self.settings.top_k, "Retrieved contexts");
        Ok(hits)
    }

    /// Answer a question from the stored chunks.
    pub async fn query(&self, user_query: &str) -> Result<QueryResponse, QueryError> {
        let user_query = user_query.trim();
        if user_query.is_empty() {
            return Err(QueryError::EmptyQuery);
        }

        let store = self.store.as_ref().ok_or(QueryError::StoreUnavailable)?;

        let hits = self
            .retrieve(store.as_ref(), user_query)
            .await
            .map_err(|e| QueryError::Retrieval(e.to_string()))?;

        if hits.is_empty() {
            info!("No contexts found for query");
            return Ok(QueryResponse::no_context());
        }

        let llm = self.llm.as_ref().ok_or(QueryError::LlmUnavailable)?;

        let contexts: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
        let request = GenerationRequest::new(build_prompt(user_query, &contexts))
            .with_system_instruction(self.settings.system_instruction.clone());
        let answer = llm.generate(request).await?;

        info!(
            contexts = contexts.len(),
            answer_chars = answer.len(),
            "Answered query"
        );

        Ok(QueryResponse {
            answer,
            contexts,
            contexts_with_metadata: hits
                .into_iter()
                .map(|h| ContextWithMetadata {
                    text: h.text,
                    metadata: h.metadata,
                })
                .collect(),
        })
    }

    /// Report the state of every component. Never fails.
    pub async fn health(&self) -> HealthResponse {
        let (collection_count, sample) = match &self.store {
            Some(store) => {
                let count = match store.count().await {
                    Ok(n) => Some(n),
                    Err(e) => {
                        warn!(error = %e, "Failed to count collection");
                        None
                    }
                };
                let sample = match store.peek(1).await {
                    Ok(mut chunks) if !chunks.is_empty() => Some(chunks.remove(0)),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Failed to read sample chunk");
                        None
                    }
                };
                (count, sample)
            }
            None => (Some(0), None),
        };

        let (sample_chunk_preview, sample_metadata) = match sample {
            Some(chunk) => (
                Some(chunk.text.chars().take(self.settings.preview_chars).collect()),
                Some(chunk.metadata),
            ),
            None => (None, None),
        };

        HealthResponse {
            ok: true,
            details: HealthDetails {
                chroma_present: self.store.is_some(),
                chroma_path: self.settings.store_location.clone(),
                collection_name: self.settings.collection_name.clone(),
                collection_count,
                gemini_initialized: self.llm.is_some(),
                gemini_model: self.settings.gemini_model.clone(),
                top_k: self.settings.top_k,
                embed_model: self.embedder.model_name().to_string(),
                sample_chunk_preview,
                sample_metadata,
            },
        }
    }

    /// Every collection in the store; empty without a store.
    pub async fn collections(&self) -> Result<CollectionsResponse, StoreError> {
        let collections = match &self.store {
            Some(store) => store
                .list_collections()
                .await?
                .into_iter()
                .map(|c| CollectionEntry {
                    is_active: c.name == self.settings.collection_name,
                    name: c.name,
                    count: c.count,
                    metadata: c.metadata,
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(CollectionsResponse {
            collections,
            active_collection: self.settings.collection_name.clone(),
            database_path: self.settings.store_location.clone(),
        })
    }

    /// Embed pre-cleaned records in batches and add them to the active collection.
    ///
    /// Records without an id get `chunk_<n>`, `n` being their position in
    /// `records`, so loading the same file twice replaces instead of duplicating.
    pub async fn ingest(&self, records: Vec<IngestRecord>) -> Result<IngestReport, FolioError> {
        let store = self.store.as_ref().ok_or_else(|| StoreError::Backend {
            message: "no vector store is available".to_string(),
        })?;

        let mut report = IngestReport::default();
        let mut pending: Vec<(String, IngestRecord)> = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            if record.text.trim().is_empty() {
                report.skipped += 1;
                continue;
            }
            let id = record
                .id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("chunk_{index}"));
            pending.push((id, record));
        }

        for batch in pending.chunks(self.settings.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, r)| r.text.clone()).collect();
            let embedder = Arc::clone(&self.embedder);
            let embeddings = tokio::task::spawn_blocking(move || {
                let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                embedder.embed_batch(&refs)
            })
            .await
            .map_err(|e| EmbedError::Inference {
                message: format!("Task join error: {e}"),
            })??;

            let chunk_records: Vec<ChunkRecord> = batch
                .iter()
                .zip(embeddings)
                .map(|((id, record), embedding)| ChunkRecord {
                    id: id.clone(),
                    text: record.text.clone(),
                    metadata: record.metadata.clone(),
                    embedding,
                })
                .collect();

            report.added += store.add(chunk_records).await?;
            report.batches += 1;
            info!(
                batch = report.batches,
                added = report.added,
                "Ingested batch"
            );
        }

        Ok(report)
    }
}
