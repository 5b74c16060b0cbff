//! Mirror job scheduling.
//!
//! Jobs are rows in `mirror_jobs`. The scheduler inserts them and sends their
//! ids to a dispatcher task, which runs each one on a [`MirrorWorker`] under a
//! semaphore permit. The partial unique index on `mirror_jobs(product_id)`
//! is the only thing deciding whether a product already has a job running.

mod progress;
mod worker;

pub use progress::ProgressTracker;
pub use worker::MirrorWorker;

use std::collections::HashSet;
use std::sync::Arc;

use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::db::entities::{mirror_job, MirrorJob};
use crate::db::now_secs;
use crate::error::{Result, ServerError};
use crate::library::{ImageLibrary, ImageStatus};
use crate::upstream::UpstreamGuard;

/// Longest failure message kept on a job row
pub const MAX_MESSAGE_CHARS: usize = 2000;

pub const DEFAULT_JOB_LIMIT: u64 = 50;
pub const MAX_JOB_LIMIT: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i32,
    pub product_id: String,
    pub index_url: String,
    pub status: String,
    pub progress: Option<i32>,
    pub message: Option<String>,
    pub version: Option<String>,
    pub image_id: Option<i32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl From<mirror_job::Model> for JobRecord {
    fn from(m: mirror_job::Model) -> Self {
        Self {
            id: m.id,
            product_id: m.product_id,
            index_url: m.index_url,
            status: m.status,
            progress: m.progress,
            message: m.message,
            version: m.version,
            image_id: m.image_id,
            created_at: m.created_at,
            updated_at: m.updated_at,
            started_at: m.started_at,
            finished_at: m.finished_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedProduct {
    pub product_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: i32,
    pub product_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnqueueResult {
    pub enqueued: Vec<String>,
    pub skipped: Vec<SkippedProduct>,
    pub jobs: Vec<JobSummary>,
}

/// What startup recovery did
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub interrupted: usize,
    /// In-flight images no job was building (crashed uploads, unlinked mirrors)
    pub orphaned_images: u64,
}

pub struct JobScheduler {
    db: Arc<DatabaseConnection>,
    guard: Arc<UpstreamGuard>,
    dispatch_tx: mpsc::UnboundedSender<i32>,
}

impl JobScheduler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        guard: Arc<UpstreamGuard>,
        dispatch_tx: mpsc::UnboundedSender<i32>,
    ) -> Self {
        Self {
            db,
            guard,
            dispatch_tx,
        }
    }

    /// Create one queued job per distinct product id and dispatch it.
    ///
    /// Products that already have a queued or running job are skipped.
    pub async fn enqueue(&self, index_url: &str, product_ids: &[String]) -> Result<EnqueueResult> {
        let index_url = self.guard.check_url(index_url)?.to_string();

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for pid in product_ids {
            let pid = pid.trim();
            if pid.is_empty() {
                return Err(ServerError::Validation("product ids must not be empty".into()));
            }
            if seen.insert(pid.to_string()) {
                unique.push(pid.to_string());
            }
        }

        let mut result = EnqueueResult::default();
        for product_id in unique {
            let now = now_secs();
            let inserted = mirror_job::ActiveModel {
                product_id: Set(product_id.clone()),
                index_url: Set(index_url.clone()),
                status: Set(JobStatus::Queued.as_str().to_string()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(self.db.as_ref())
            .await;

            match inserted {
                Ok(job) => {
                    tracing::info!("Queued mirror job {} for {}", job.id, product_id);
                    self.dispatch(job.id);
                    result.jobs.push(JobSummary {
                        job_id: job.id,
                        product_id: product_id.clone(),
                    });
                    result.enqueued.push(product_id);
                }
                Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    tracing::debug!("Skipping {}: job already in progress", product_id);
                    result.skipped.push(SkippedProduct {
                        product_id,
                        reason: "already in progress".to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(result)
    }

    fn dispatch(&self, job_id: i32) {
        if self.dispatch_tx.send(job_id).is_err() {
            // Row stays queued; recovery picks it up on the next start
            tracing::error!("Mirror dispatcher is gone, job {} stays queued", job_id);
        }
    }

    pub async fn get_job(&self, id: i32) -> Result<JobRecord> {
        MirrorJob::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .map(JobRecord::from)
            .ok_or_else(|| ServerError::NotFound(format!("job {}", id)))
    }

    /// Newest jobs first
    pub async fn list_jobs(&self, limit: Option<u64>) -> Result<Vec<JobRecord>> {
        let limit = limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, MAX_JOB_LIMIT);
        Ok(MirrorJob::find()
            .order_by_desc(mirror_job::Column::CreatedAt)
            .order_by_desc(mirror_job::Column::Id)
            .limit(limit)
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(JobRecord::from)
            .collect())
    }

    /// Re-dispatch queued jobs; fail jobs a crash left running along with
    /// every image still marked in flight.
    ///
    /// Must run before any job is dispatched or upload accepted: at that point
    /// no in-flight image has a live owner.
    pub async fn recover(&self, library: &ImageLibrary) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let interrupted = MirrorJob::find()
            .filter(mirror_job::Column::Status.eq(JobStatus::Running.as_str()))
            .all(self.db.as_ref())
            .await?;
        for job in interrupted {
            self.fail(job.id, "interrupted by service restart").await?;
            if let Some(image_id) = job.image_id {
                match library
                    .update_status(
                        image_id,
                        ImageStatus::Error,
                        Some("interrupted by service restart".to_string()),
                    )
                    .await
                {
                    Ok(()) | Err(ServerError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            report.interrupted += 1;
        }

        report.orphaned_images = library
            .fail_in_flight("interrupted by service restart")
            .await?;

        let queued = MirrorJob::find()
            .filter(mirror_job::Column::Status.eq(JobStatus::Queued.as_str()))
            .order_by_asc(mirror_job::Column::Id)
            .all(self.db.as_ref())
            .await?;
        for job in queued {
            self.dispatch(job.id);
            report.requeued += 1;
        }

        if report.requeued > 0 || report.interrupted > 0 || report.orphaned_images > 0 {
            tracing::info!(
                "Job recovery: {} requeued, {} interrupted, {} orphaned images failed",
                report.requeued,
                report.interrupted,
                report.orphaned_images
            );
        }
        Ok(report)
    }

    /// queued -> running. Returns `None` if the job was not queued.
    pub async fn claim(&self, job_id: i32) -> Result<Option<mirror_job::Model>> {
        let now = now_secs();
        let updated = MirrorJob::update_many()
            .col_expr(mirror_job::Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(mirror_job::Column::StartedAt, Expr::value(now))
            .col_expr(mirror_job::Column::UpdatedAt, Expr::value(now))
            .filter(mirror_job::Column::Id.eq(job_id))
            .filter(mirror_job::Column::Status.eq(JobStatus::Queued.as_str()))
            .exec(self.db.as_ref())
            .await?;
        if updated.rows_affected == 0 {
            return Ok(None);
        }
        Ok(MirrorJob::find_by_id(job_id).one(self.db.as_ref()).await?)
    }

    /// Record the resolved version and the image being built
    pub async fn link_image(&self, job_id: i32, version: &str, image_id: i32) -> Result<()> {
        MirrorJob::update_many()
            .col_expr(mirror_job::Column::Version, Expr::value(version))
            .col_expr(mirror_job::Column::ImageId, Expr::value(image_id))
            .col_expr(mirror_job::Column::UpdatedAt, Expr::value(now_secs()))
            .filter(mirror_job::Column::Id.eq(job_id))
            .filter(mirror_job::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    pub async fn set_progress(&self, job_id: i32, progress: i32) -> Result<()> {
        MirrorJob::update_many()
            .col_expr(mirror_job::Column::Progress, Expr::value(progress.clamp(0, 100)))
            .col_expr(mirror_job::Column::UpdatedAt, Expr::value(now_secs()))
            .filter(mirror_job::Column::Id.eq(job_id))
            .filter(mirror_job::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// running -> completed
    pub async fn complete(&self, job_id: i32) -> Result<()> {
        let now = now_secs();
        let updated = MirrorJob::update_many()
            .col_expr(mirror_job::Column::Status, Expr::value(JobStatus::Completed.as_str()))
            .col_expr(mirror_job::Column::Progress, Expr::value(100))
            .col_expr(mirror_job::Column::FinishedAt, Expr::value(now))
            .col_expr(mirror_job::Column::UpdatedAt, Expr::value(now))
            .filter(mirror_job::Column::Id.eq(job_id))
            .filter(mirror_job::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await?;
        if updated.rows_affected > 0 {
            tracing::info!("Mirror job {} completed", job_id);
        }
        Ok(())
    }

    /// Any non-terminal state -> failed
    pub async fn fail(&self, job_id: i32, message: &str) -> Result<()> {
        let now = now_secs();
        let updated = MirrorJob::update_many()
            .col_expr(mirror_job::Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(mirror_job::Column::Message, Expr::value(truncate_message(message)))
            .col_expr(mirror_job::Column::FinishedAt, Expr::value(now))
            .col_expr(mirror_job::Column::UpdatedAt, Expr::value(now))
            .filter(mirror_job::Column::Id.eq(job_id))
            .filter(
                mirror_job::Column::Status
                    .is_in([JobStatus::Queued.as_str(), JobStatus::Running.as_str()]),
            )
            .exec(self.db.as_ref())
            .await?;
        if updated.rows_affected > 0 {
            tracing::warn!("Mirror job {} failed: {}", job_id, message);
        }
        Ok(())
    }
}

pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_MESSAGE_CHARS).collect()
}

/// Dispatcher feeding job ids to a bounded number of concurrent workers
pub struct WorkerPool {
    handle: JoinHandle<()>,
}

impl WorkerPool {
    pub fn spawn(
        worker: Arc<MirrorWorker>,
        mut rx: mpsc::UnboundedReceiver<i32>,
        size: usize,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(size.max(1)));

        let handle = tokio::spawn(async move {
            while let Some(job_id) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let worker = worker.clone();
                tokio::spawn(async move {
                    tracing::debug!("Worker picked up job {}", job_id);
                    worker.run(job_id).await;
                    drop(permit);
                });
            }
            tracing::info!("Mirror dispatcher stopped");
        });

        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}
