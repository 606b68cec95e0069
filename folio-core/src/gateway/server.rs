//! HTTP server built on axum.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use std::future::Future;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::{ApiError, GatewayConfig};
use crate::rag::{CollectionsResponse, HealthResponse, QueryRequest, QueryResponse, RagService};

/// The service shared by all handlers.
pub type SharedService = Arc<RagService>;

/// Build the API router.
pub fn router(service: SharedService) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/collections", get(collections_handler))
        .route("/query", post(query_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn health_handler(State(service): State<SharedService>) -> Json<HealthResponse> {
    Json(service.health().await)
}

async fn collections_handler(
    State(service): State<SharedService>,
) -> Result<Json<CollectionsResponse>, ApiError> {
    service
        .collections()
        .await
        .map(Json)
        .map_err(ApiError::collections)
}

async fn query_handler(
    State(service): State<SharedService>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    // Every body problem is a validation error, whatever axum's own status.
    let Json(request) = payload
        .map_err(|rejection| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()))?;

    match service.query(&request.user_query).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            let api: ApiError = e.into();
            if api.status.is_server_error() {
                warn!(status = api.status.as_u16(), detail = api.detail.as_str(), "Query failed");
            }
            Err(api)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_on<F>(
    listener: tokio::net::TcpListener,
    service: SharedService,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(service);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Bind the configured address and serve until ctrl-c.
pub async fn run(service: SharedService, config: &GatewayConfig) -> Result<(), std::io::Error> {
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = addr.as_str(), "Folio API listening");
    serve_on(listener, service, shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::rag::RagSettings;
    use axum::body::Body;
    use tower::ServiceExt;

    fn empty_service() -> SharedService {
        Arc::new(RagService::new(
            None,
            Arc::new(LocalEmbedder::new(16)),
            None,
            RagSettings::default(),
        ))
    }

    #[test]
    fn test_router_builds() {
        let _app = router(empty_service());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(empty_service());
        let req = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["details"]["chroma_present"], false);
        assert_eq!(json["details"]["gemini_initialized"], false);
        assert_eq!(json["details"]["collection_name"], "rag_collection");
    }

    #[tokio::test]
    async fn test_query_malformed_json_is_422() {
        let app = router(empty_service());
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/query")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);
    }

    #[tokio::test]
    async fn test_query_missing_field_is_422() {
        let app = router(empty_service());
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"question": "Who?"}"#))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["detail"].as_str().unwrap().contains("user_query"));
    }

    #[tokio::test]
    async fn test_cors_preflight_allowed() {
        let app = router(empty_service());
        let req = axum::http::Request::builder()
            .method("OPTIONS")
            .uri("/query")
            .header("origin", "http://localhost:8501")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }
}
