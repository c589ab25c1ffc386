//! HTTP server for the image cache proxy
//!
//! Provides /health, /image and the /admin cache-management endpoints.

use crate::error::Result;
use crate::fetch::{encode_png, parse_image_url, ImageFetcher};
use crate::types::{HealthResponse, ImageQuery, MaxDiskUsageRequest};
use axum::{
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use image_cache::{disk_ceiling, CacheStats, CachedImage, ImageCache, RequestDescriptor};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_CACHE_TIER: HeaderName = HeaderName::from_static("x-cache-tier");

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: ImageCache,
    pub fetcher: ImageFetcher,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: ImageCache, fetcher: ImageFetcher) -> Self {
        Self {
            cache,
            fetcher,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/image", get(get_image).delete(delete_image))
        .route("/admin/clear", post(clear_cache))
        .route("/admin/reset", post(reset_cache))
        .route("/admin/max-disk-usage", put(set_max_disk_usage))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server; queued disk writes are flushed after Ctrl-C.
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = state.cache.flush().await {
        warn!(error = %e, "Failed to flush disk writes on shutdown");
    }
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down gracefully");
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.cache.stats(),
    })
}

/// Serve an image from cache, fetching it from its origin on a miss
async fn get_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Result<Response> {
    let url = parse_image_url(&query.url)?;
    let descriptor = RequestDescriptor::new(url.as_str());

    let (image, cache_header, tier): (CachedImage, _, _) =
        match state.cache.lookup_hit(&descriptor).await? {
            Some(hit) => (hit.image, "HIT", hit.tier.as_str()),
            None => {
                let image = Arc::new(state.fetcher.fetch(&url).await?);
                state.cache.store(&descriptor, image.clone()).await?;
                (image, "MISS", "origin")
            }
        };
    debug!(url = %url, cache = cache_header, tier, "Serving image");

    let body = encode_png(image).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "public, max-age=86400"),
            (X_CACHE, cache_header),
            (X_CACHE_TIER, tier),
        ],
        body,
    )
        .into_response())
}

/// Drop one image from both tiers
async fn delete_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Result<StatusCode> {
    let url = parse_image_url(&query.url)?;
    state.cache.invalidate_url(url.as_str()).await?;
    info!(url = %url, "Invalidated image");
    Ok(StatusCode::NO_CONTENT)
}

/// Empty both tiers
async fn clear_cache(State(state): State<SharedState>) -> StatusCode {
    state.cache.clear_all().await;
    StatusCode::NO_CONTENT
}

/// Recreate the cache directory from scratch
async fn reset_cache(State(state): State<SharedState>) -> Result<StatusCode> {
    state.cache.clear_cache_directory().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_max_disk_usage(
    State(state): State<SharedState>,
    Json(request): Json<MaxDiskUsageRequest>,
) -> Result<Json<CacheStats>> {
    let summary = state
        .cache
        .set_max_disk_usage(disk_ceiling(request.bytes))
        .await?;
    info!(
        requested = request.bytes,
        entries_removed = summary.entries_removed,
        bytes_freed = summary.bytes_freed,
        "Updated disk ceiling"
    );
    Ok(Json(state.cache.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use image_cache::ImageCacheConfig;
    use std::io::Cursor;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn create_test_state(cache_dir: &Path) -> SharedState {
        let cache = ImageCache::open(ImageCacheConfig {
            cache_dir: cache_dir.to_path_buf(),
            memory_capacity: 1024 * 1024,
            max_disk_usage: 1024 * 1024,
        })
        .await
        .unwrap();
        let fetcher = ImageFetcher::new(Duration::from_secs(5)).unwrap();
        Arc::new(ServerState::new(cache, fetcher))
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(RgbaImage::new(width, height))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    /// Local origin server; returns its base URL.
    async fn spawn_origin() -> String {
        let png = png_bytes(6, 4);
        let app = Router::new()
            .route(
                "/cat.png",
                get(move || async move { ([(header::CONTENT_TYPE, "image/png")], png) }),
            )
            .route("/notes.txt", get(|| async { "not an image" }))
            .route("/missing.png", get(|| async { StatusCode::NOT_FOUND }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let response = router.oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].as_u64().is_some());
        assert_eq!(json["cache"]["memory_entries"], 0);
        assert_eq!(json["cache"]["max_disk_usage"], 1024 * 1024);
    }

    #[tokio::test]
    async fn test_image_miss_then_hit() {
        let dir = tempdir().unwrap();
        let origin = spawn_origin().await;
        let router = create_router(create_test_state(dir.path()).await);
        let uri = format!("/image?url={}/cat.png", origin);

        let response = router.clone().oneshot(request("GET", &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "MISS");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let decoded = image::load_from_memory_with_format(&body, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (6, 4));

        let response = router.oneshot(request("GET", &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(response.headers()["x-cache-tier"], "memory");
    }

    #[tokio::test]
    async fn test_invalid_url_is_bad_request() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let response = router
            .clone()
            .oneshot(request("GET", "/image?url=not-a-url"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"]
            .as_str()
            .unwrap()
            .contains("Invalid image URL"));

        let response = router.oneshot(request("GET", "/image")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upstream_failures_are_bad_gateway() {
        let dir = tempdir().unwrap();
        let origin = spawn_origin().await;
        let state = create_test_state(dir.path()).await;
        let router = create_router(state.clone());

        for path in ["missing.png", "notes.txt"] {
            let uri = format!("/image?url={}/{}", origin, path);
            let response = router.clone().oneshot(request("GET", &uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        assert_eq!(state.cache.stats().memory_entries, 0);
    }

    #[tokio::test]
    async fn test_delete_image_invalidates() {
        let dir = tempdir().unwrap();
        let origin = spawn_origin().await;
        let state = create_test_state(dir.path()).await;
        let router = create_router(state.clone());
        let uri = format!("/image?url={}/cat.png", origin);

        router.clone().oneshot(request("GET", &uri)).await.unwrap();
        state.cache.flush().await.unwrap();
        assert_eq!(state.cache.stats().disk_entries, 1);

        for _ in 0..2 {
            let response = router
                .clone()
                .oneshot(request("DELETE", &uri))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
        assert_eq!(state.cache.stats().disk_entries, 0);

        let response = router.oneshot(request("GET", &uri)).await.unwrap();
        assert_eq!(response.headers()["x-cache"], "MISS");
    }

    #[tokio::test]
    async fn test_admin_clear_and_reset() {
        let dir = tempdir().unwrap();
        let origin = spawn_origin().await;
        let state = create_test_state(dir.path()).await;
        let router = create_router(state.clone());

        let uri = format!("/image?url={}/cat.png", origin);
        router.clone().oneshot(request("GET", &uri)).await.unwrap();
        state.cache.flush().await.unwrap();

        let response = router
            .clone()
            .oneshot(request("POST", "/admin/clear"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let stats = state.cache.stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.disk_bytes, 0);

        let response = router
            .oneshot(request("POST", "/admin/reset"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_set_max_disk_usage() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()).await);

        let put = |body: &'static str| {
            Request::builder()
                .method("PUT")
                .uri("/admin/max-disk-usage")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let response = router
            .clone()
            .oneshot(put(r#"{"bytes": 2048}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["max_disk_usage"], 2048);

        let response = router.oneshot(put(r#"{"bytes": -5}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["max_disk_usage"], 0);
    }
}
