//! Integration tests for the HTTP backends against in-process mock servers.
//!
//! Each test starts a small axum app on 127.0.0.1:0 that imitates the remote
//! API and records what it receives.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use folio_core::{
    ChromaHttpStore, ChunkRecord, GeminiProvider, GenerationRequest, LlmConfig, LlmError,
    LlmProvider, Metadata, QueryError, StoreConfig, VectorStore, config::RetryConfig,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

type Recorded = Arc<Mutex<Vec<(String, Value)>>>;

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// --- Chroma ---

const COLLECTIONS: &str = "/api/v2/tenants/{tenant}/databases/{database}/collections";

fn chroma_app(recorded: Recorded) -> Router {
    async fn create(
        State(rec): State<Recorded>,
        Path((tenant, database)): Path<(String, String)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        rec.lock()
            .unwrap()
            .push((format!("create {tenant}/{database}"), body.clone()));
        Json(json!({"id": "col-123", "name": body["name"], "metadata": null}))
    }

    async fn list() -> Json<Value> {
        Json(json!([
            {"id": "col-123", "name": "julius_caesar", "metadata": {"hnsw:space": "cosine"}},
            {"id": "col-456", "name": "hamlet", "metadata": null}
        ]))
    }

    async fn count(Path((_, _, id)): Path<(String, String, String)>) -> (StatusCode, Json<Value>) {
        match id.as_str() {
            "col-123" => (StatusCode::OK, Json(json!(2))),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"}))),
        }
    }

    async fn get_chunks(
        State(rec): State<Recorded>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        rec.lock().unwrap().push(("get".into(), body));
        Json(json!({
            "ids": ["c1"],
            "documents": ["Friends, Romans, countrymen, lend me your ears"],
            "metadatas": [{"act": 3, "scene": 2, "page_number": 88}]
        }))
    }

    async fn query(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
        rec.lock().unwrap().push(("query".into(), body));
        Json(json!({
            "ids": [["c2", "c1"]],
            "documents": [["Et tu, Brute?", "Friends, Romans, countrymen"]],
            "metadatas": [[{"act": 3, "scene": 1}, {"act": 3, "scene": 2}]],
            "distances": [[0.12, 0.48]]
        }))
    }

    async fn upsert(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
        rec.lock().unwrap().push(("upsert".into(), body));
        Json(json!({}))
    }

    Router::new()
        .route(COLLECTIONS, post(create).get(list))
        .route(&format!("{COLLECTIONS}/{{id}}/count"), get(count))
        .route(&format!("{COLLECTIONS}/{{id}}/get"), post(get_chunks))
        .route(&format!("{COLLECTIONS}/{{id}}/query"), post(query))
        .route(&format!("{COLLECTIONS}/{{id}}/upsert"), post(upsert))
        .with_state(recorded)
}

async fn connect_chroma() -> (ChromaHttpStore, Recorded) {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let url = spawn(chroma_app(recorded.clone())).await;
    let config = StoreConfig {
        collection_name: "julius_caesar".into(),
        url: Some(url.clone()),
        ..StoreConfig::default()
    };
    let store = ChromaHttpStore::connect(&url, &config).await.unwrap();
    (store, recorded)
}

#[tokio::test]
async fn test_chroma_get_or_create_on_connect() {
    let (store, recorded) = connect_chroma().await;
    assert_eq!(store.collection_name(), "julius_caesar");
    assert!(store.is_persistent());

    let calls = recorded.lock().unwrap().clone();
    assert_eq!(calls[0].0, "create default_tenant/default_database");
    assert_eq!(
        calls[0].1,
        json!({"name": "julius_caesar", "get_or_create": true})
    );
}

#[tokio::test]
async fn test_chroma_count_and_peek() {
    let (store, recorded) = connect_chroma().await;
    assert_eq!(store.count().await.unwrap(), 2);

    let sample = store.peek(1).await.unwrap();
    assert_eq!(sample.len(), 1);
    assert_eq!(sample[0].id, "c1");
    assert_eq!(sample[0].metadata.get("page_number"), Some(&json!(88)));

    let calls = recorded.lock().unwrap().clone();
    let (_, body) = calls.iter().find(|(name, _)| name == "get").unwrap();
    assert_eq!(body["limit"], 1);
}

#[tokio::test]
async fn test_chroma_query_unwraps_nested_arrays() {
    let (store, recorded) = connect_chroma().await;
    let hits = store.query(&[0.1, 0.2, 0.3], 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].text, "Et tu, Brute?");
    assert!((hits[0].distance.unwrap() - 0.12).abs() < 1e-6);
    assert_eq!(hits[1].metadata.get("scene"), Some(&json!(2)));

    let calls = recorded.lock().unwrap().clone();
    let (_, body) = calls.iter().find(|(name, _)| name == "query").unwrap();
    assert_eq!(body["n_results"], 2);
    assert_eq!(body["query_embeddings"][0].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_chroma_add_sends_parallel_arrays() {
    let (store, recorded) = connect_chroma().await;
    let mut metadata = Metadata::new();
    metadata.insert("act".into(), json!(5));
    let written = store
        .add(vec![
            ChunkRecord {
                id: "c9".into(),
                text: "This was the noblest Roman of them all.".into(),
                metadata,
                embedding: vec![0.5, 0.5],
            },
            ChunkRecord {
                id: "c10".into(),
                text: "Exeunt.".into(),
                metadata: Metadata::new(),
                embedding: vec![0.0, 1.0],
            },
        ])
        .await
        .unwrap();
    assert_eq!(written, 2);

    let calls = recorded.lock().unwrap().clone();
    let (_, body) = calls.iter().find(|(name, _)| name == "upsert").unwrap();
    assert_eq!(body["ids"], json!(["c9", "c10"]));
    assert_eq!(body["metadatas"], json!([{"act": 5}, null]));
    assert_eq!(body["embeddings"][1], json!([0.0, 1.0]));
}

#[tokio::test]
async fn test_chroma_list_collections_tolerates_count_failure() {
    let (store, _) = connect_chroma().await;
    let collections = store.list_collections().await.unwrap();
    assert_eq!(collections.len(), 2);
    assert_eq!(collections[0].name, "julius_caesar");
    assert_eq!(collections[0].count, Some(2));
    assert!(collections[0].metadata.is_some());
    assert_eq!(collections[1].name, "hamlet");
    assert_eq!(collections[1].count, None);
    assert!(collections[1].metadata.is_none());
}

#[tokio::test]
async fn test_chroma_connect_failure() {
    let config = StoreConfig::default();
    // Nothing listens on port 9 (discard) on test machines.
    let result = ChromaHttpStore::connect("http://127.0.0.1:9", &config).await;
    assert!(result.is_err());
}

// --- Gemini ---

fn gemini_config(base_url: String) -> LlmConfig {
    LlmConfig {
        base_url: Some(base_url),
        retry: RetryConfig {
            max_retries: 2,
            max_timeout_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..LlmConfig::default()
    }
}

#[tokio::test]
async fn test_gemini_generate_round_trip() {
    async fn generate(
        State(rec): State<Recorded>,
        Path(model_method): Path<String>,
        axum::extract::RawQuery(query): axum::extract::RawQuery,
        headers: axum::http::HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let key = headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        rec.lock().unwrap().push((
            format!("{model_method}?{} key={key}", query.unwrap_or_default()),
            body,
        ));
        Json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": " Brutus joins the conspiracy. "}]},
                "finishReason": "STOP"
            }]
        }))
    }

    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/models/{model_method}", post(generate))
        .with_state(recorded.clone());
    let url = spawn(app).await;

    let provider = GeminiProvider::new_with_key(&gemini_config(url), "test-key".into()).unwrap();
    let answer = provider
        .generate(
            GenerationRequest::new("Context:\n...\n\nUser Query:\nWho?\n\nAnswer:")
                .with_system_instruction("Answer the user query strictly based on the provided context."),
        )
        .await
        .unwrap();
    assert_eq!(answer, "Brutus joins the conspiracy.");

    let calls = recorded.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "gemini-2.5-flash:generateContent? key=test-key");
    assert_eq!(
        calls[0].1["system_instruction"]["parts"][0]["text"],
        "Answer the user query strictly based on the provided context."
    );
}

#[tokio::test]
async fn test_gemini_retries_server_errors_then_succeeds() {
    async fn flaky(State(calls): State<Arc<Mutex<u32>>>) -> (StatusCode, Json<Value>) {
        let mut n = calls.lock().unwrap();
        *n += 1;
        if *n == 1 {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": {"message": "overloaded"}})),
            )
        } else {
            (
                StatusCode::OK,
                Json(json!({"candidates": [{"content": {"parts": [{"text": "ok"}]}}]})),
            )
        }
    }

    let calls = Arc::new(Mutex::new(0u32));
    let app = Router::new()
        .route("/models/{model_method}", post(flaky))
        .with_state(calls.clone());
    let url = spawn(app).await;

    let provider = GeminiProvider::new_with_key(&gemini_config(url), "k".into()).unwrap();
    let answer = provider.generate(GenerationRequest::new("q")).await.unwrap();
    assert_eq!(answer, "ok");
    assert_eq!(*calls.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_gemini_auth_failure_is_not_retried() {
    async fn forbidden(State(calls): State<Arc<Mutex<u32>>>) -> (StatusCode, Json<Value>) {
        *calls.lock().unwrap() += 1;
        (
            StatusCode::FORBIDDEN,
            Json(json!({"error": {"message": "API key not valid"}})),
        )
    }

    let calls = Arc::new(Mutex::new(0u32));
    let app = Router::new()
        .route("/models/{model_method}", post(forbidden))
        .with_state(calls.clone());
    let url = spawn(app).await;

    let provider = GeminiProvider::new_with_key(&gemini_config(url), "bad".into()).unwrap();
    let err = provider.generate(GenerationRequest::new("q")).await.unwrap_err();
    assert!(matches!(err, LlmError::AuthFailed { .. }));
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_gemini_unreachable_error_does_not_leak_key() {
    // Nothing listens on port 9 (discard) on test machines.
    let provider = GeminiProvider::new_with_key(
        &gemini_config("http://127.0.0.1:9".into()),
        "SECRET-KEY-123".into(),
    )
    .unwrap();
    let err = provider.generate(GenerationRequest::new("q")).await.unwrap_err();
    assert!(matches!(err, LlmError::Connection { .. }), "got {err:?}");

    let detail = QueryError::Generation(err).to_string();
    assert!(detail.starts_with("Gemini API call failed:"));
    assert!(!detail.contains("SECRET-KEY-123"), "key leaked: {detail}");
}

#[tokio::test]
async fn test_gemini_server_error_detail_does_not_leak_key() {
    async fn broken() -> (StatusCode, Json<Value>) {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"message": "internal"}})),
        )
    }

    let app = Router::new().route("/models/{model_method}", post(broken));
    let url = spawn(app).await;

    let provider =
        GeminiProvider::new_with_key(&gemini_config(url), "SECRET-KEY-456".into()).unwrap();
    let err = provider.generate(GenerationRequest::new("q")).await.unwrap_err();
    assert!(matches!(err, LlmError::Unavailable { status: 500, .. }));
    assert!(!QueryError::Generation(err).to_string().contains("SECRET-KEY-456"));
}
