//! Remote Chroma server over the v2 REST API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ChunkRecord, CollectionInfo, Metadata, StoreConfig, StoredChunk, VectorStore,
    metadata_from_value,
};
use crate::error::StoreError;

/// Client for one collection on a Chroma server.
#[derive(Debug)]
pub struct ChromaHttpStore {
    client: Client,
    base_url: String,
    tenant: String,
    database: String,
    collection: String,
    collection_id: String,
}

impl ChromaHttpStore {
    /// Connect to `url` and get-or-create the configured collection.
    pub async fn connect(url: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| StoreError::Http {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        let mut store = Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            tenant: config.tenant.clone(),
            database: config.database.clone(),
            collection: config.collection_name.clone(),
            collection_id: String::new(),
        };

        let created = store
            .send(
                store.client.post(store.collections_url()).json(&json!({
                    "name": store.collection,
                    "get_or_create": true,
                })),
            )
            .await?;
        store.collection_id = created["id"]
            .as_str()
            .ok_or_else(|| StoreError::Http {
                message: "Chroma response is missing the collection id".to_string(),
            })?
            .to_string();

        info!(
            url = store.base_url.as_str(),
            collection = store.collection.as_str(),
            collection_id = store.collection_id.as_str(),
            "Connected to Chroma collection"
        );
        Ok(store)
    }

    fn collections_url(&self) -> String {
        format!(
            "{}/api/v2/tenants/{}/databases/{}/collections",
            self.base_url, self.tenant, self.database
        )
    }

    fn collection_url(&self, id: &str, action: &str) -> String {
        format!("{}/{}/{}", self.collections_url(), id, action)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, StoreError> {
        let response = request.send().await.map_err(|e| StoreError::Http {
            message: format!("Request to Chroma failed: {e}"),
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| StoreError::Http {
            message: format!("Failed to read Chroma response: {e}"),
        })?;
        if !status.is_success() {
            return Err(StoreError::Http {
                message: format!("HTTP {status} from Chroma: {body}"),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn count_of(&self, id: &str) -> Result<usize, StoreError> {
        let value = self
            .send(self.client.get(self.collection_url(id, "count")))
            .await?;
        value.as_u64().map(|n| n as usize).ok_or_else(|| StoreError::Http {
            message: format!("Unexpected count response: {value}"),
        })
    }
}

/// Zip Chroma's parallel `ids`/`documents`/`metadatas`/`distances` arrays.
fn zip_rows(ids: &Value, documents: &Value, metadatas: &Value, distances: &Value) -> Vec<StoredChunk> {
    let Some(ids) = ids.as_array() else {
        return Vec::new();
    };
    ids.iter()
        .enumerate()
        .map(|(i, id)| StoredChunk {
            id: id.as_str().unwrap_or_default().to_string(),
            text: documents[i].as_str().unwrap_or_default().to_string(),
            metadata: metadata_from_value(&metadatas[i]),
            distance: distances[i].as_f64().map(|d| d as f32),
        })
        .collect()
}

fn metadata_or_null(metadata: &Metadata) -> Value {
    if metadata.is_empty() {
        Value::Null
    } else {
        Value::Object(metadata.clone())
    }
}

#[async_trait]
impl VectorStore for ChromaHttpStore {
    fn collection_name(&self) -> &str {
        &self.collection
    }

    fn location(&self) -> String {
        self.base_url.clone()
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.count_of(&self.collection_id).await
    }

    async fn peek(&self, limit: usize) -> Result<Vec<StoredChunk>, StoreError> {
        let value = self
            .send(
                self.client
                    .post(self.collection_url(&self.collection_id, "get"))
                    .json(&json!({
                        "limit": limit,
                        "include": ["documents", "metadatas"],
                    })),
            )
            .await?;
        Ok(zip_rows(
            &value["ids"],
            &value["documents"],
            &value["metadatas"],
            &Value::Null,
        ))
    }

    async fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        if n_results == 0 {
            return Ok(Vec::new());
        }
        let value = self
            .send(
                self.client
                    .post(self.collection_url(&self.collection_id, "query"))
                    .json(&json!({
                        "query_embeddings": [embedding],
                        "n_results": n_results,
                        "include": ["documents", "metadatas", "distances"],
                    })),
            )
            .await?;
        let hits = zip_rows(
            &value["ids"][0],
            &value["documents"][0],
            &value["metadatas"][0],
            &value["distances"][0],
        );
        debug!(returned = hits.len(), "Chroma query complete");
        Ok(hits)
    }

    async fn add(&self, records: Vec<ChunkRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let documents: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
        let embeddings: Vec<&[f32]> = records.iter().map(|r| r.embedding.as_slice()).collect();
        let metadatas: Vec<Value> = records.iter().map(|r| metadata_or_null(&r.metadata)).collect();

        self.send(
            self.client
                .post(self.collection_url(&self.collection_id, "upsert"))
                .json(&json!({
                    "ids": ids,
                    "embeddings": embeddings,
                    "documents": documents,
                    "metadatas": metadatas,
                })),
        )
        .await?;
        Ok(records.len())
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, StoreError> {
        let value = self.send(self.client.get(self.collections_url())).await?;
        let entries = value.as_array().cloned().unwrap_or_default();

        // Counts are fetched concurrently; a failed count is reported as unknown.
        let collections = futures::future::join_all(entries.iter().map(|entry| async move {
            let count = match entry["id"].as_str() {
                Some(id) => self.count_of(id).await.ok(),
                None => None,
            };
            CollectionInfo {
                name: entry["name"].as_str().unwrap_or_default().to_string(),
                count,
                metadata: match &entry["metadata"] {
                    Value::Object(map) => Some(map.clone()),
                    _ => None,
                },
            }
        }))
        .await;
        Ok(collections)
    }
}
