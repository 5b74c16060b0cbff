pub mod handlers;
pub mod upload;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{services::ServeDir, trace::TraceLayer};

pub use handlers::{
    delete_image, enqueue_mirror, get_image, get_job, health, list_images, list_jobs,
    list_upstream_products, list_upstream_streams, simplestream_info, AppState,
};
pub use upload::upload_custom_image;

/// Create the full router:
/// - JSON API under /api
/// - the published simplestream tree under /streams
/// - artifact bytes under /uploads
pub fn build_router(state: Arc<AppState>) -> Router {
    let streams_dir = state.config.publish_root.join("streams");
    let artifact_root = state.config.artifact_root.clone();
    let upload_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/api/health", get(health))
        // Upstream browsing
        .route("/api/upstream/streams", get(list_upstream_streams))
        .route("/api/upstream/streams/:stream_id/products", get(list_upstream_products))
        // Mirror jobs
        .route("/api/mirror", post(enqueue_mirror))
        .route("/api/mirror/jobs", get(list_jobs))
        .route("/api/mirror/jobs/:id", get(get_job))
        // Library
        .route("/api/images", get(list_images))
        .route("/api/images/:id", get(get_image).delete(delete_image))
        .route(
            "/api/custom/images",
            post(upload_custom_image).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/simplestream", get(simplestream_info))
        .with_state(state)
        // Consumer-facing static trees
        .nest_service("/streams", ServeDir::new(streams_dir))
        .nest_service("/uploads", ServeDir::new(artifact_root))
        .layer(TraceLayer::new_for_http())
}
