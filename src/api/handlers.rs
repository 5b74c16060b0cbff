use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::custom::CustomIntake;
use crate::db::init_database;
use crate::error::{Result, ServerError};
use crate::jobs::{EnqueueResult, JobRecord, JobScheduler, MirrorWorker, WorkerPool};
use crate::library::{ImageFilter, ImageLibrary, ImageRecord, ImageSource, ImageStatus};
use crate::publish::{PublicationEngine, INDEX_PATH};
use crate::storage::{ArtifactFetcher, ArtifactStore};
use crate::upstream::{UpstreamClient, UpstreamGuard, UpstreamProduct, UpstreamStream};

/// Application state shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    pub upstream: Arc<UpstreamClient>,
    pub library: Arc<ImageLibrary>,
    pub scheduler: Arc<JobScheduler>,
    pub publisher: Arc<PublicationEngine>,
    pub intake: Arc<CustomIntake>,
    pub workers: WorkerPool,
}

impl AppState {
    /// Open the database, recover interrupted jobs, start the worker pool and
    /// publish the current library
    pub async fn build(config: ServerConfig) -> Result<Self> {
        config.ensure_dirs()?;

        let db = Arc::new(init_database(&config.database_path).await?);
        tracing::info!("Database initialized at {:?}", config.database_path);

        let store = Arc::new(ArtifactStore::new(
            config.artifact_root.clone(),
            config.staging_dir.clone(),
        ));
        let cleared = store.clear_staging().await?;
        if cleared > 0 {
            tracing::info!("Removed {} interrupted staging files", cleared);
        }

        let guard = Arc::new(UpstreamGuard::new(config.upstream.allow_private_networks));
        if config.upstream.allow_private_networks {
            tracing::warn!("Private network upstreams are allowed");
        }
        let upstream = Arc::new(UpstreamClient::new(guard.clone(), config.upstream.clone()));
        let fetcher = Arc::new(ArtifactFetcher::new(upstream.clone(), store.clone()));
        let library = Arc::new(ImageLibrary::new(db.clone(), store));
        let publisher = Arc::new(PublicationEngine::new(
            library.clone(),
            config.publish_root.clone(),
            config.publish_statuses.clone(),
        ));

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(JobScheduler::new(db, guard, dispatch_tx));
        let worker = Arc::new(MirrorWorker::new(
            scheduler.clone(),
            upstream.clone(),
            fetcher,
            library.clone(),
            publisher.clone(),
        ));
        let workers = WorkerPool::spawn(worker, dispatch_rx, config.workers);
        tracing::info!("Mirror worker pool started ({} workers)", config.workers);

        scheduler.recover(&library).await?;
        publisher.republish().await?;

        let intake = Arc::new(CustomIntake::new(library.clone(), publisher.clone()));

        Ok(Self {
            config,
            upstream,
            library,
            scheduler,
            publisher,
            intake,
            workers,
        })
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.workers.abort();
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
pub struct IndexQuery {
    pub index_url: String,
}

pub async fn list_upstream_streams(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Result<Json<Vec<UpstreamStream>>> {
    Ok(Json(state.upstream.list_streams(&query.index_url).await?))
}

pub async fn list_upstream_products(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
    Query(query): Query<IndexQuery>,
) -> Result<Json<Vec<UpstreamProduct>>> {
    Ok(Json(
        state
            .upstream
            .list_products(&query.index_url, &stream_id)
            .await?,
    ))
}

#[derive(Deserialize)]
pub struct MirrorRequest {
    pub index_url: String,
    #[serde(default)]
    pub product_ids: Vec<String>,
}

pub async fn enqueue_mirror(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MirrorRequest>,
) -> Result<Json<EnqueueResult>> {
    let result = state
        .scheduler
        .enqueue(&request.index_url, &request.product_ids)
        .await?;
    tracing::info!(
        "Mirror request: {} enqueued, {} skipped",
        result.enqueued.len(),
        result.skipped.len()
    );
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct JobsQuery {
    pub limit: Option<u64>,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<serde_json::Value>> {
    let jobs = state.scheduler.list_jobs(query.limit).await?;
    Ok(Json(serde_json::json!({ "items": jobs })))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<JobRecord>> {
    Ok(Json(state.scheduler.get_job(id).await?))
}

#[derive(Deserialize)]
pub struct ImagesQuery {
    pub status: Option<String>,
    pub source: Option<String>,
}

pub async fn list_images(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImagesQuery>,
) -> Result<Json<serde_json::Value>> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            ImageStatus::parse(raw)
                .ok_or_else(|| ServerError::Validation(format!("unknown status {:?}", raw)))?,
        ),
        None => None,
    };
    let source = match query.source.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            ImageSource::parse(raw)
                .ok_or_else(|| ServerError::Validation(format!("unknown source {:?}", raw)))?,
        ),
        None => None,
    };

    let images = state.library.list(&ImageFilter { status, source }).await?;
    Ok(Json(serde_json::json!({ "items": images })))
}

pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<ImageRecord>> {
    Ok(Json(state.library.get(id).await?))
}

pub async fn delete_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Response> {
    state.library.delete(id).await?;

    if let Err(e) = state.publisher.republish().await {
        tracing::error!("Republish after deleting image {} failed: {}", id, e);
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn simplestream_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "index": format!("/{}", INDEX_PATH) }))
}
