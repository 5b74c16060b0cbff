use std::sync::Arc;

use super::{JobScheduler, ProgressTracker};
use crate::db::entities::mirror_job;
use crate::error::{Result, ServerError};
use crate::library::{ImageLibrary, ImageSource, ImageStatus, NewArtifact, NewImage};
use crate::publish::PublicationEngine;
use crate::storage::{sanitize_relative, ArtifactFetcher, Expected};
use crate::upstream::UpstreamClient;

/// Executes one mirror job from claim to completion
pub struct MirrorWorker {
    scheduler: Arc<JobScheduler>,
    upstream: Arc<UpstreamClient>,
    fetcher: Arc<ArtifactFetcher>,
    library: Arc<ImageLibrary>,
    publisher: Arc<PublicationEngine>,
}

/// State a failed attempt has to clean up
#[derive(Default)]
struct Attempt {
    image_id: Option<i32>,
    fetched: Vec<String>,
}

impl MirrorWorker {
    pub fn new(
        scheduler: Arc<JobScheduler>,
        upstream: Arc<UpstreamClient>,
        fetcher: Arc<ArtifactFetcher>,
        library: Arc<ImageLibrary>,
        publisher: Arc<PublicationEngine>,
    ) -> Self {
        Self {
            scheduler,
            upstream,
            fetcher,
            library,
            publisher,
        }
    }

    /// Run job `job_id`. Errors end up on the job row, never here.
    pub async fn run(&self, job_id: i32) {
        let job = match self.scheduler.claim(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!("Job {} is no longer queued, skipping", job_id);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to claim job {}: {}", job_id, e);
                return;
            }
        };

        tracing::info!("Mirroring {} (job {})", job.product_id, job.id);

        let mut attempt = Attempt::default();
        match self.mirror(&job, &mut attempt).await {
            Ok(()) => {
                if let Err(e) = self.scheduler.complete(job.id).await {
                    tracing::error!("Failed to mark job {} completed: {}", job.id, e);
                }
            }
            Err(e) => self.abandon(&job, attempt, &e).await,
        }

        if let Err(e) = self.publisher.republish().await {
            tracing::error!("Republish after job {} failed: {}", job.id, e);
        }
    }

    async fn mirror(&self, job: &mirror_job::Model, attempt: &mut Attempt) -> Result<()> {
        let resolved = self
            .upstream
            .resolve_product(&job.index_url, &job.product_id)
            .await?;
        let entry = &resolved.entry;

        let image_id = self
            .library
            .create(NewImage {
                product_id: resolved.product_id.clone(),
                stream_id: resolved.stream_id.clone(),
                name: entry.image_name(),
                source: ImageSource::Mirrored,
                status: ImageStatus::Pending,
                status_detail: Some("Resolving artifacts".to_string()),
                origin_index_url: Some(job.index_url.clone()),
                os: entry.meta_str("os"),
                release: entry.meta_str("release"),
                release_title: entry.meta_str("release_title"),
                release_codename: entry.meta_str("release_codename"),
                version: entry.meta_str("version"),
                arch: entry.meta_str("arch"),
                subarch: entry.meta_str("subarch"),
                subarches: entry.meta_str("subarches"),
                label: entry.meta_str("label"),
                kflavor: entry.meta_str("kflavor"),
                krel: entry.meta_str("krel"),
                build_id: Some(resolved.version.clone()),
                product_meta: entry.meta.clone(),
                version_meta: resolved.version_meta.clone(),
            })
            .await?;
        attempt.image_id = Some(image_id);

        self.scheduler
            .link_image(job.id, &resolved.version, image_id)
            .await?;
        self.library
            .update_status(
                image_id,
                ImageStatus::Mirroring,
                Some("Downloading artifacts".to_string()),
            )
            .await?;

        let declared: Vec<Option<u64>> = resolved.items.iter().map(|(_, item)| item.size).collect();
        let tracker = ProgressTracker::new(self.scheduler.clone(), job.id, &declared);

        let mut artifacts = Vec::with_capacity(resolved.items.len());
        for (idx, (name, item)) in resolved.items.iter().enumerate() {
            tracker.start_item(idx).await;

            let clean = sanitize_relative(&item.path).ok_or_else(|| {
                ServerError::ProtocolParse(format!("item {} has unusable path {:?}", name, item.path))
            })?;
            let relative = format!("mirror/{}/{}", image_id, clean);
            let url = resolved.item_url(item)?;
            let expected = Expected {
                size: item.size,
                sha256: item.sha256.clone(),
            };

            let fetched = self
                .fetcher
                .fetch(url.as_str(), &relative, &expected, &tracker)
                .await
                .map_err(|e| with_item(name, e))?;
            attempt.fetched.push(fetched.relative_path.clone());

            artifacts.push(NewArtifact {
                name: name.clone(),
                ftype: item.ftype.clone().unwrap_or_else(|| name.clone()),
                relative_path: fetched.relative_path,
                size: fetched.size,
                sha256: fetched.sha256,
                source_url: Some(url.to_string()),
                item_meta: item.extra.clone(),
            });
        }

        self.library.attach_and_mark_ready(image_id, artifacts).await?;
        Ok(())
    }

    async fn abandon(&self, job: &mirror_job::Model, attempt: Attempt, error: &ServerError) {
        let message = error.to_string();

        if !attempt.fetched.is_empty() {
            self.library
                .store()
                .remove_all_best_effort(&attempt.fetched)
                .await;
        }

        if let Some(image_id) = attempt.image_id {
            if let Err(e) = self
                .library
                .update_status(
                    image_id,
                    ImageStatus::Error,
                    Some(super::truncate_message(&message)),
                )
                .await
            {
                tracing::error!("Failed to mark image {} as error: {}", image_id, e);
            }
        }

        if let Err(e) = self.scheduler.fail(job.id, &message).await {
            tracing::error!("Failed to mark job {} failed: {}", job.id, e);
        }
    }
}

/// Prefix an error with the item it happened on, keeping its kind
fn with_item(name: &str, error: ServerError) -> ServerError {
    match error {
        ServerError::Integrity(m) => ServerError::Integrity(format!("{}: {}", name, m)),
        ServerError::UpstreamUnreachable(m) => {
            ServerError::UpstreamUnreachable(format!("{}: {}", name, m))
        }
        ServerError::UpstreamBlocked(m) => ServerError::UpstreamBlocked(format!("{}: {}", name, m)),
        ServerError::Storage(m) => ServerError::Storage(format!("{}: {}", name, m)),
        other => other,
    }
}
