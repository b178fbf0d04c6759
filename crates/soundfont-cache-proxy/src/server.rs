//! HTTP server for the cache proxy
//!
//! Provides /health, /fetch and /control endpoints.

use crate::control::{self, ControlMessage, ControlResponse};
use crate::error::ProxyError;
use crate::proxy::CacheProxy;
use crate::types::{FetchRequest, HealthResponse};
use axum::{
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub proxy: CacheProxy,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(proxy: CacheProxy) -> Self {
        Self {
            proxy,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fetch", get(fetch))
        .route("/control", post(control_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        lifecycle: state.proxy.lifecycle().await.as_str().to_string(),
        favorites: state.proxy.pins().list().await,
        cache: state.proxy.stats().await,
    })
}

/// Fetch a URL through the cache
async fn fetch(State(state): State<SharedState>, Query(request): Query<FetchRequest>) -> Response {
    let result = state
        .proxy
        .fetch(
            &request.url,
            request.key.as_deref(),
            request.category.as_deref(),
        )
        .await;

    match result {
        Ok(outcome) => (
            [
                (header::CONTENT_TYPE, outcome.content_type),
                (
                    HeaderName::from_static("x-cache"),
                    outcome.status.as_str().to_string(),
                ),
                (
                    HeaderName::from_static("x-cache-category"),
                    outcome.category.as_str().to_string(),
                ),
            ],
            outcome.data,
        )
            .into_response(),
        Err(ProxyError::Upstream { url, status }) => {
            warn!(url = %url, status, "Upstream refused request");
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            error_response(code, format!("Upstream returned status {}", status))
        }
        Err(e) => {
            warn!(url = %request.url, error = %e, "Fetch failed");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// Control channel endpoint
async fn control_message(
    State(state): State<SharedState>,
    Json(message): Json<ControlMessage>,
) -> Result<Json<ControlResponse>, Response> {
    control::handle(&state.proxy, message)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Control message failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_origin;
    use crate::types::ProxyConfig;
    use crate::upstream::UpstreamFetcher;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::Path;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn create_test_state(cache_dir: &Path) -> SharedState {
        let config = ProxyConfig {
            cache_dir: cache_dir.to_path_buf(),
            ..Default::default()
        };
        let proxy = CacheProxy::open(config, UpstreamFetcher::new())
            .await
            .unwrap();
        Arc::new(ServerState::new(proxy))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn fetch_uri(url: &str, key: &str) -> String {
        format!(
            "/fetch?url={}&key={}&category=soundfont",
            urlencoding::encode(url),
            urlencoding::encode(key)
        )
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["lifecycle"], "installing");
        assert!(json["uptime_secs"].as_u64().is_some());
        assert!(json["cache"]["entries"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_fetch_reports_miss_then_hit() {
        let origin = spawn_origin().await;
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);
        let uri = fetch_uri(&origin.url("/soundfonts/oboe.json"), "oboe");

        let first = router
            .clone()
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert_eq!(first.headers()["x-cache-category"], "soundfont");
        assert_eq!(first.headers()[header::CONTENT_TYPE], "application/json");

        let second = router
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.headers()["x-cache"], "HIT");
        let json = body_json(second).await;
        assert_eq!(json["instrument"], "oboe");
        assert_eq!(origin.requests(), 1);
    }

    #[tokio::test]
    async fn test_fetch_upstream_not_found() {
        let origin = spawn_origin().await;
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let response = router
            .oneshot(
                Request::builder()
                    .uri(fetch_uri(&origin.url("/missing"), "missing"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_fetch_requires_url() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let response = router
            .oneshot(Request::builder().uri("/fetch").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_control_endpoint() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/control")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"type":"GET_CACHE_STATS"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["totalSize"], 0);
        assert_eq!(json["quota"], 500 * 1024 * 1024);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/control")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"type":"CLEANUP_CACHE","requiredSpace":1024}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["freedSpace"], 0);
    }

    #[tokio::test]
    async fn test_server_state_new() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path()).await;

        let diff = (Utc::now() - state.started_at).num_seconds();
        assert!((0..5).contains(&diff));
    }
}
