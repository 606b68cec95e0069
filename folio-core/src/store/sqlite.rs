//! SQLite-backed vector store.
//!
//! Embeddings are stored as little-endian `f32` blobs and ranked by brute-force
//! cosine distance. Collections of a few thousand chunks (one play) rank in
//! well under a millisecond per query, so no ANN index is kept.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::{ChunkRecord, CollectionInfo, Metadata, StoredChunk, VectorStore};
use crate::embeddings::cosine_similarity;
use crate::error::StoreError;

/// Database file created inside the persist directory.
pub const DB_FILE: &str = "folio.sqlite3";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    metadata   TEXT,
    dimension  INTEGER,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chunks (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    id            TEXT NOT NULL,
    text          TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    UNIQUE (collection_id, id)
);
CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks (collection_id, seq);
";

/// A vector store in a single SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    collection: String,
    collection_id: i64,
    location: String,
    persistent: bool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("collection", &self.collection)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) `dir/folio.sqlite3` and get-or-create `collection`.
    pub fn open(dir: &Path, collection: &str) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        Self::init(conn, collection, dir.display().to_string(), true)
    }

    /// A store that lives only as long as the process.
    pub fn in_memory(collection: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, collection, ":memory:".to_string(), false)
    }

    fn init(
        conn: Connection,
        collection: &str,
        location: String,
        persistent: bool,
    ) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM collections WHERE name = ?1",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;

        let collection_id = match existing {
            Some(id) => {
                info!(collection, "Using existing collection");
                id
            }
            None => {
                let metadata = serde_json::json!({"space": "cosine"}).to_string();
                conn.execute(
                    "INSERT INTO collections (name, metadata, created_at) VALUES (?1, ?2, ?3)",
                    params![collection, metadata, chrono::Utc::now().to_rfc3339()],
                )?;
                info!(collection, "Created collection");
                conn.last_insert_rowid()
            }
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            collection: collection.to_string(),
            collection_id,
            location,
            persistent,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection, i64) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let collection_id = self.collection_id;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Backend {
                message: "connection mutex poisoned".to_string(),
            })?;
            f(&mut guard, collection_id)
        })
        .await
        .map_err(|e| StoreError::Backend {
            message: format!("Task join error: {e}"),
        })?
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn parse_metadata(raw: &str) -> Result<Metadata, StoreError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    Ok(super::metadata_from_value(&value))
}

fn collection_dimension(conn: &Connection, collection_id: i64) -> Result<Option<usize>, StoreError> {
    let dim: Option<i64> = conn.query_row(
        "SELECT dimension FROM collections WHERE id = ?1",
        params![collection_id],
        |row| row.get(0),
    )?;
    Ok(dim.map(|d| d as usize))
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn collection_name(&self) -> &str {
        &self.collection
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn, collection_id| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE collection_id = ?1",
                params![collection_id],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    async fn peek(&self, limit: usize) -> Result<Vec<StoredChunk>, StoreError> {
        self.with_conn(move |conn, collection_id| {
            let mut stmt = conn.prepare(
                "SELECT id, text, metadata FROM chunks
                 WHERE collection_id = ?1 ORDER BY seq LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![collection_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, text, raw)| {
                    Ok(StoredChunk {
                        id,
                        text,
                        metadata: parse_metadata(&raw)?,
                        distance: None,
                    })
                })
                .collect()
        })
        .await
    }

    async fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        if n_results == 0 {
            return Ok(Vec::new());
        }
        let query = embedding.to_vec();
        self.with_conn(move |conn, collection_id| {
            if let Some(expected) = collection_dimension(conn, collection_id)?
                && expected != query.len()
            {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    found: query.len(),
                });
            }

            let mut stmt = conn.prepare(
                "SELECT id, text, metadata, embedding FROM chunks
                 WHERE collection_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![collection_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut scored: Vec<(f32, String, String, String)> = rows
                .into_iter()
                .map(|(id, text, raw, blob)| {
                    let distance = 1.0 - cosine_similarity(&query, &decode_embedding(&blob));
                    (distance, id, text, raw)
                })
                .collect();
            // Stable sort: equal distances keep insertion order.
            scored.sort_by(|a, b| a.0.total_cmp(&b.0));
            scored.truncate(n_results);

            debug!(
                collection_id,
                returned = scored.len(),
                "Ranked chunks by cosine distance"
            );

            scored
                .into_iter()
                .map(|(distance, id, text, raw)| {
                    Ok(StoredChunk {
                        id,
                        text,
                        metadata: parse_metadata(&raw)?,
                        distance: Some(distance),
                    })
                })
                .collect()
        })
        .await
    }

    async fn add(&self, records: Vec<ChunkRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn, collection_id| {
            let tx = conn.transaction()?;

            let expected = match collection_dimension(&tx, collection_id)? {
                Some(dim) => dim,
                None => {
                    let dim = records[0].embedding.len();
                    tx.execute(
                        "UPDATE collections SET dimension = ?1 WHERE id = ?2",
                        params![dim as i64, collection_id],
                    )?;
                    dim
                }
            };

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO chunks (collection_id, id, text, metadata, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (collection_id, id) DO UPDATE SET
                         text = excluded.text,
                         metadata = excluded.metadata,
                         embedding = excluded.embedding",
                )?;
                for record in &records {
                    if record.embedding.len() != expected {
                        return Err(StoreError::DimensionMismatch {
                            expected,
                            found: record.embedding.len(),
                        });
                    }
                    let metadata = serde_json::to_string(&record.metadata)?;
                    stmt.execute(params![
                        collection_id,
                        record.id,
                        record.text,
                        metadata,
                        encode_embedding(&record.embedding),
                    ])?;
                }
            }

            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, StoreError> {
        self.with_conn(|conn, _| {
            let mut stmt = conn.prepare(
                "SELECT c.name, c.metadata, COUNT(k.seq)
                 FROM collections c LEFT JOIN chunks k ON k.collection_id = c.id
                 GROUP BY c.id ORDER BY c.name",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(name, raw, count)| {
                    let metadata = raw.as_deref().map(parse_metadata).transpose()?;
                    Ok(CollectionInfo {
                        name,
                        count: Some(count as usize),
                        metadata,
                    })
                })
                .collect()
        })
        .await
    }
}
