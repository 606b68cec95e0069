//! HTTP client for a running Folio API, plus terminal rendering.

use folio_core::{
    CollectionsResponse, HealthResponse, Metadata, QueryRequest, QueryResponse, find_marker,
};
use serde::de::DeserializeOwned;
use std::fmt::Write as _;
use std::time::Duration;

/// Errors talking to the API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(
        "Connection Error: Could not connect to the backend service at {url}. Ensure the backend is running."
    )]
    Connection { url: String },

    #[error("API Error: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("An unexpected error occurred: {0}")]
    Other(String),
}

/// Thin typed wrapper over the three endpoints.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ClientError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(
        &self,
        url: String,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                ClientError::Connection { url: url.clone() }
            } else {
                ClientError::Other(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Other(e.to_string()))
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let url = self.endpoint("/health");
        self.read(url.clone(), self.client.get(&url)).await
    }

    pub async fn collections(&self) -> Result<CollectionsResponse, ClientError> {
        let url = self.endpoint("/collections");
        self.read(url.clone(), self.client.get(&url)).await
    }

    pub async fn query(&self, user_query: &str) -> Result<QueryResponse, ClientError> {
        let url = self.endpoint("/query");
        let body = QueryRequest {
            user_query: user_query.to_string(),
        };
        self.read(url.clone(), self.client.post(&url).json(&body))
            .await
    }
}

/// Act / scene / page / cleaned lines for one context.
fn metadata_lines(metadata: &Metadata) -> Vec<String> {
    let present = |key: &str| {
        metadata
            .get(key)
            .filter(|v| !v.is_null() && **v != serde_json::Value::Bool(false))
            .map(display_value)
    };
    let mut lines = Vec::new();
    if let Some(act) = present("act") {
        lines.push(format!("Act: {act}"));
    }
    if let Some(scene) = present("scene") {
        lines.push(format!("Scene: {scene}"));
    }
    if let Some(page) = present("page_number").or_else(|| present("page")) {
        lines.push(format!("Page: {page}"));
    }
    if present("cleaned").is_some() {
        lines.push("Cleaned".to_string());
    }
    lines
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render an answer and its contexts for the terminal.
pub fn render_answer(response: &QueryResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Answer\n------\n{}\n", response.answer);
    let _ = writeln!(out, "Contexts Used\n-------------");

    if !response.contexts_with_metadata.is_empty() {
        for (i, ctx) in response.contexts_with_metadata.iter().enumerate() {
            let _ = writeln!(out, "[Chunk {}]", i + 1);
            let meta = metadata_lines(&ctx.metadata);
            if !meta.is_empty() {
                let _ = writeln!(out, "  {}", meta.join(" | "));
            }
            let _ = writeln!(out, "{}\n", ctx.text);
        }
    } else if !response.contexts.is_empty() {
        for (i, context) in response.contexts.iter().enumerate() {
            let _ = writeln!(out, "Chunk {}: {}", i + 1, context);
        }
    } else {
        let _ = writeln!(out, "No contexts were retrieved or used.");
    }
    out
}

fn preview(text: &str, chars: usize) -> String {
    let mut short: String = text.chars().take(chars).collect();
    if text.chars().count() > chars {
        short.push_str("...");
    }
    short
}

fn artifact_verdict(text: &str) -> String {
    match find_marker(text) {
        Some(m) => format!("WARNING: contains {} '{}'", m.kind, m.matched),
        None => "appears clean".to_string(),
    }
}

/// Report on `/health`.
pub fn render_health(health: &HealthResponse) -> String {
    let d = &health.details;
    let mut out = String::new();
    if d.chroma_present {
        let _ = writeln!(out, "  [ok] Vector store: connected");
        let _ = writeln!(out, "  [ok] Collection: {}", d.collection_name);
        let count = d
            .collection_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let _ = writeln!(out, "  [ok] Document count: {count}");
        let _ = writeln!(out, "  [ok] Database path: {}", d.chroma_path);
    } else {
        let _ = writeln!(out, "  [!!] Vector store: NOT connected");
    }
    if d.gemini_initialized {
        let _ = writeln!(out, "  [ok] Gemini: initialized ({})", d.gemini_model);
    } else {
        let _ = writeln!(out, "  [!!] Gemini: NOT initialized");
    }
    let _ = writeln!(out, "  Embedding model: {}, top_k: {}", d.embed_model, d.top_k);

    if let Some(sample) = &d.sample_chunk_preview {
        let _ = writeln!(out, "  Sample chunk: {}", preview(sample, 100));
        let _ = writeln!(out, "  Sample chunk {}", artifact_verdict(sample));
    }
    if let Some(meta) = &d.sample_metadata {
        let lines = metadata_lines(meta);
        if !lines.is_empty() {
            let _ = writeln!(out, "  Sample metadata: {}", lines.join(" | "));
        }
    }
    out
}

/// Report on `/collections`.
pub fn render_collections(collections: &CollectionsResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "  Found {} collection(s):",
        collections.collections.len()
    );
    for c in &collections.collections {
        let count = c
            .count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let active = if c.is_active { " (active)" } else { "" };
        let _ = writeln!(out, "  - {} (count: {}){}", c.name, count, active);
    }
    let _ = writeln!(out, "  Active collection: {}", collections.active_collection);
    let _ = writeln!(out, "  Database path: {}", collections.database_path);
    out
}

/// Short report on one `/query` response, flagging artifacts in the first context.
pub fn render_query_check(response: &QueryResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "  Answer ({} chars): {}",
        response.answer.chars().count(),
        preview(&response.answer, 200)
    );
    let _ = writeln!(out, "  Contexts: {} chunks retrieved", response.contexts.len());
    if let Some(first) = response.contexts.first() {
        let _ = writeln!(out, "  First context: {}", preview(first, 150));
        if let Some(ctx) = response.contexts_with_metadata.first() {
            let lines = metadata_lines(&ctx.metadata);
            if !lines.is_empty() {
                let _ = writeln!(out, "  Metadata: {}", lines.join(" | "));
            }
        }
        let _ = writeln!(out, "  First context {}", artifact_verdict(first));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::ContextWithMetadata;
    use pretty_assertions::assert_eq;

    fn meta(json: serde_json::Value) -> Metadata {
        match json {
            serde_json::Value::Object(m) => m,
            _ => Metadata::new(),
        }
    }

    #[test]
    fn test_metadata_lines() {
        let lines = metadata_lines(&meta(serde_json::json!({
            "act": 3, "scene": "2", "page_number": 88, "cleaned": true
        })));
        assert_eq!(lines, vec!["Act: 3", "Scene: 2", "Page: 88", "Cleaned"]);

        let lines = metadata_lines(&meta(serde_json::json!({"cleaned": false, "act": null})));
        assert!(lines.is_empty());
    }

    #[test]
    fn test_render_answer_with_metadata() {
        let response = QueryResponse {
            answer: "Brutus.".into(),
            contexts: vec!["Et tu, Brute?".into()],
            contexts_with_metadata: vec![ContextWithMetadata {
                text: "Et tu, Brute?".into(),
                metadata: meta(serde_json::json!({"act": 3, "scene": 1})),
            }],
        };
        let out = render_answer(&response);
        assert!(out.contains("Brutus."));
        assert!(out.contains("[Chunk 1]"));
        assert!(out.contains("Act: 3 | Scene: 1"));
        assert!(out.contains("Et tu, Brute?"));
    }

    #[test]
    fn test_render_answer_falls_back_to_plain_contexts() {
        let response = QueryResponse {
            answer: "A".into(),
            contexts: vec!["one".into(), "two".into()],
            contexts_with_metadata: Vec::new(),
        };
        let out = render_answer(&response);
        assert!(out.contains("Chunk 1: one"));
        assert!(out.contains("Chunk 2: two"));
    }

    #[test]
    fn test_render_answer_without_contexts() {
        let response = QueryResponse {
            answer: "I could not find any relevant information in the knowledge base.".into(),
            contexts: Vec::new(),
            contexts_with_metadata: Vec::new(),
        };
        assert!(render_answer(&response).contains("No contexts were retrieved or used."));
    }

    #[test]
    fn test_query_check_flags_artifacts() {
        let response = QueryResponse {
            answer: "x".into(),
            contexts: vec!["33 Julius Caesar ACT 2. SC. 1 and more".into()],
            contexts_with_metadata: Vec::new(),
        };
        let out = render_query_check(&response);
        assert!(out.contains("WARNING: contains page header"));
    }

    #[test]
    fn test_preview_truncates_on_chars() {
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
        assert_eq!(preview("ééé", 2), "éé...");
    }

    #[test]
    fn test_client_error_messages() {
        let err = ClientError::Connection {
            url: "http://localhost:8000/query".into(),
        };
        assert!(err.to_string().starts_with("Connection Error: Could not connect"));
        let err = ClientError::Api {
            status: 503,
            body: r#"{"detail":"ChromaDB collection is unavailable."}"#.into(),
        };
        assert!(err.to_string().starts_with("API Error: 503 - "));
    }

    #[tokio::test]
    async fn test_client_against_live_router() {
        use folio_core::{LocalEmbedder, RagService, RagSettings};
        use std::sync::Arc;

        let service = Arc::new(RagService::new(
            None,
            Arc::new(LocalEmbedder::new(16)),
            None,
            RagSettings::default(),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(folio_core::gateway::serve_on(
            listener,
            service,
            std::future::pending::<()>(),
        ));

        let client = ApiClient::new(&format!("http://{addr}/"), 5).unwrap();
        let health = client.health().await.unwrap();
        assert!(health.ok);
        assert!(!health.details.chroma_present);

        let collections = client.collections().await.unwrap();
        assert!(collections.collections.is_empty());

        let err = client.query("Who is Brutus?").await.unwrap_err();
        match err {
            ClientError::Api { status, body } => {
                assert_eq!(status, 503);
                assert!(body.contains("ChromaDB collection is unavailable."));
            }
            other => panic!("Expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_connection_refused() {
        let client = ApiClient::new("http://127.0.0.1:9", 2).unwrap();
        let err = client.health().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }));
    }
}
