//! SQLite-backed image library.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tokio::sync::Mutex;

use super::{
    encode_meta, ArtifactKind, ImageFilter, ImageRecord, ImageStatus, NewArtifact, NewImage,
};
use crate::db::entities::{artifact, image, mirror_job, Artifact, Image, MirrorJob};
use crate::db::now_secs;
use crate::error::{Result, ServerError};
use crate::storage::ArtifactStore;

const IN_FLIGHT: [&str; 3] = ["pending", "mirroring", "uploading"];
const ACTIVE_JOB: [&str; 2] = ["queued", "running"];

/// Durable image records plus the artifact files they own.
///
/// Every public method runs in one database transaction. Writes to the same
/// image are serialized through a per-row lock; unrelated images never wait
/// on each other.
pub struct ImageLibrary {
    db: Arc<DatabaseConnection>,
    store: Arc<ArtifactStore>,
    row_locks: DashMap<i32, Arc<Mutex<()>>>,
}

impl ImageLibrary {
    pub fn new(db: Arc<DatabaseConnection>, store: Arc<ArtifactStore>) -> Self {
        Self {
            db,
            store,
            row_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    fn row_lock(&self, id: i32) -> Arc<Mutex<()>> {
        self.row_locks.entry(id).or_default().clone()
    }

    /// Insert a new image row and return its id
    pub async fn create(&self, new: NewImage) -> Result<i32> {
        if new.product_id.trim().is_empty() {
            return Err(ServerError::Validation("product id is required".into()));
        }

        let now = now_secs();
        let model = image::ActiveModel {
            product_id: Set(new.product_id),
            stream_id: Set(new.stream_id),
            name: Set(new.name),
            source: Set(new.source.as_str().to_string()),
            status: Set(new.status.as_str().to_string()),
            status_detail: Set(new.status_detail),
            origin_index_url: Set(new.origin_index_url),
            os: Set(new.os),
            release: Set(new.release),
            release_title: Set(new.release_title),
            release_codename: Set(new.release_codename),
            version: Set(new.version),
            arch: Set(new.arch),
            subarch: Set(new.subarch),
            subarches: Set(new.subarches),
            label: Set(new.label),
            kflavor: Set(new.kflavor),
            krel: Set(new.krel),
            build_id: Set(new.build_id),
            product_meta: Set(encode_meta(&new.product_meta)),
            version_meta: Set(encode_meta(&new.version_meta)),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(self.db.as_ref())
        .await?;

        tracing::info!(
            "Created image {} for {} ({})",
            model.id,
            model.product_id,
            model.status
        );
        Ok(model.id)
    }

    pub async fn get(&self, id: i32) -> Result<ImageRecord> {
        let txn = self.db.begin().await?;
        let model = Image::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("image {}", id)))?;
        let mut records = load_records(&txn, vec![model]).await?;
        txn.commit().await?;

        records
            .pop()
            .ok_or_else(|| ServerError::NotFound(format!("image {}", id)))
    }

    /// Images matching `filter`, newest first
    pub async fn list(&self, filter: &ImageFilter) -> Result<Vec<ImageRecord>> {
        let mut query = Image::find();
        if let Some(status) = filter.status {
            query = query.filter(image::Column::Status.eq(status.as_str()));
        }
        if let Some(source) = filter.source {
            query = query.filter(image::Column::Source.eq(source.as_str()));
        }

        let txn = self.db.begin().await?;
        let models = query
            .order_by_desc(image::Column::CreatedAt)
            .order_by_desc(image::Column::Id)
            .all(&txn)
            .await?;
        let records = load_records(&txn, models).await?;
        txn.commit().await?;
        Ok(records)
    }

    /// Set status and detail. `ready` is refused for images without artifacts.
    pub async fn update_status(
        &self,
        id: i32,
        status: ImageStatus,
        detail: Option<String>,
    ) -> Result<()> {
        let lock = self.row_lock(id);
        let _guard = lock.lock().await;

        let txn = self.db.begin().await?;
        let model = Image::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("image {}", id)))?;

        if status == ImageStatus::Ready {
            let count = Artifact::find()
                .filter(artifact::Column::ImageId.eq(id))
                .count(&txn)
                .await?;
            if count == 0 {
                return Err(ServerError::Conflict(format!(
                    "image {} has no artifacts and cannot be ready",
                    id
                )));
            }
        }

        let mut active: image::ActiveModel = model.into();
        active.status = Set(status.as_str().to_string());
        active.status_detail = Set(detail);
        active.updated_at = Set(now_secs());
        active.update(&txn).await?;
        txn.commit().await?;

        tracing::debug!("Image {} -> {}", id, status.as_str());
        Ok(())
    }

    /// Move every in-flight image to `error`. Only valid while nothing is
    /// building images, i.e. at startup before workers receive jobs.
    pub async fn fail_in_flight(&self, detail: &str) -> Result<u64> {
        let updated = Image::update_many()
            .col_expr(image::Column::Status, Expr::value(ImageStatus::Error.as_str()))
            .col_expr(image::Column::StatusDetail, Expr::value(detail))
            .col_expr(image::Column::UpdatedAt, Expr::value(now_secs()))
            .filter(image::Column::Status.is_in(IN_FLIGHT))
            .exec(self.db.as_ref())
            .await?;
        Ok(updated.rows_affected)
    }

    /// Attach verified artifacts and mark the image `ready` in one transaction.
    ///
    /// Older settled images of the same product are removed in the same
    /// transaction; their ids are returned and their files deleted afterwards.
    pub async fn attach_and_mark_ready(
        &self,
        id: i32,
        artifacts: Vec<NewArtifact>,
    ) -> Result<Vec<i32>> {
        if artifacts.is_empty() {
            return Err(ServerError::Validation(format!(
                "image {} needs at least one artifact to become ready",
                id
            )));
        }
        for a in &artifacts {
            self.store.resolve(&a.relative_path)?;
        }

        let lock = self.row_lock(id);
        let _guard = lock.lock().await;

        let txn = self.db.begin().await?;
        let model = Image::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("image {}", id)))?;
        let product_id = model.product_id.clone();
        let now = now_secs();

        for a in artifacts {
            artifact::ActiveModel {
                image_id: Set(id),
                kind: Set(ArtifactKind::from_ftype(&a.ftype).as_str().to_string()),
                name: Set(a.name),
                ftype: Set(a.ftype),
                relative_path: Set(a.relative_path),
                size: Set(a.size as i64),
                sha256: Set(a.sha256),
                source_url: Set(a.source_url),
                item_meta: Set(encode_meta(&a.item_meta)),
                created_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }

        let mut active: image::ActiveModel = model.into();
        active.status = Set(ImageStatus::Ready.as_str().to_string());
        active.status_detail = Set(None);
        active.updated_at = Set(now);
        active.update(&txn).await?;

        let superseded: Vec<i32> = Image::find()
            .filter(image::Column::ProductId.eq(product_id.as_str()))
            .filter(image::Column::Id.ne(id))
            .filter(image::Column::Status.is_not_in(IN_FLIGHT))
            .all(&txn)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();

        let mut stale_files = Vec::new();
        if !superseded.is_empty() {
            stale_files = Artifact::find()
                .filter(artifact::Column::ImageId.is_in(superseded.clone()))
                .all(&txn)
                .await?
                .into_iter()
                .map(|a| a.relative_path)
                .collect();
            Artifact::delete_many()
                .filter(artifact::Column::ImageId.is_in(superseded.clone()))
                .exec(&txn)
                .await?;
            Image::delete_many()
                .filter(image::Column::Id.is_in(superseded.clone()))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        if !superseded.is_empty() {
            tracing::info!(
                "Image {} ready for {}, superseding {:?}",
                id,
                product_id,
                superseded
            );
            self.store.remove_all_best_effort(&stale_files).await;
            for old in &superseded {
                self.row_locks.remove(old);
            }
        } else {
            tracing::info!("Image {} ready for {}", id, product_id);
        }

        Ok(superseded)
    }

    /// Delete an image and its artifact rows, then its files.
    ///
    /// Refused while the image is in flight or its product has an active job.
    pub async fn delete(&self, id: i32) -> Result<()> {
        let lock = self.row_lock(id);
        let guard = lock.lock().await;

        let txn = self.db.begin().await?;
        let model = Image::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("image {}", id)))?;

        if ImageStatus::parse(&model.status).is_some_and(|s| s.is_in_flight()) {
            return Err(ServerError::Conflict(format!(
                "image {} is {}; wait for it to finish",
                id, model.status
            )));
        }

        let active_jobs = MirrorJob::find()
            .filter(mirror_job::Column::ProductId.eq(model.product_id.as_str()))
            .filter(mirror_job::Column::Status.is_in(ACTIVE_JOB))
            .count(&txn)
            .await?;
        if active_jobs > 0 {
            return Err(ServerError::Conflict(format!(
                "a mirror job for {} is in progress",
                model.product_id
            )));
        }

        let files: Vec<String> = Artifact::find()
            .filter(artifact::Column::ImageId.eq(id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|a| a.relative_path)
            .collect();

        Artifact::delete_many()
            .filter(artifact::Column::ImageId.eq(id))
            .exec(&txn)
            .await?;
        Image::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;

        drop(guard);
        self.row_locks.remove(&id);

        self.store.remove_all_best_effort(&files).await;
        tracing::info!("Deleted image {} ({} files)", id, files.len());
        Ok(())
    }

    /// Consistent view of every image in `statuses`, ordered by product id
    pub async fn snapshot(&self, statuses: &[ImageStatus]) -> Result<Vec<ImageRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin().await?;
        let models = Image::find()
            .filter(image::Column::Status.is_in(statuses.iter().map(|s| s.as_str())))
            .order_by_asc(image::Column::ProductId)
            .order_by_asc(image::Column::Id)
            .all(&txn)
            .await?;
        let records = load_records(&txn, models).await?;
        txn.commit().await?;
        Ok(records)
    }
}

/// Join artifact rows onto image rows, keeping the image order
async fn load_records<C: ConnectionTrait>(
    conn: &C,
    images: Vec<image::Model>,
) -> Result<Vec<ImageRecord>> {
    if images.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i32> = images.iter().map(|m| m.id).collect();
    let mut by_image: HashMap<i32, Vec<artifact::Model>> = HashMap::new();
    for a in Artifact::find()
        .filter(artifact::Column::ImageId.is_in(ids))
        .order_by_asc(artifact::Column::Name)
        .all(conn)
        .await?
    {
        by_image.entry(a.image_id).or_default().push(a);
    }

    Ok(images
        .into_iter()
        .map(|m| {
            let artifacts = by_image.remove(&m.id).unwrap_or_default();
            ImageRecord::from_models(m, artifacts)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use crate::library::ImageSource;
    use crate::storage::sink::sha256_hex;
    use tempfile::TempDir;

    async fn library(temp_dir: &TempDir) -> ImageLibrary {
        let db = init_database(&temp_dir.path().join("library.db")).await.unwrap();
        let store = Arc::new(ArtifactStore::new(
            temp_dir.path().join("uploads"),
            temp_dir.path().join("staging"),
        ));
        ImageLibrary::new(Arc::new(db), store)
    }

    fn new_image(product_id: &str, status: ImageStatus) -> NewImage {
        NewImage {
            product_id: product_id.to_string(),
            stream_id: "com.example:stable".to_string(),
            name: "Noble (amd64)".to_string(),
            status,
            arch: Some("amd64".to_string()),
            build_id: Some("20240301".to_string()),
            ..Default::default()
        }
    }

    async fn put_file(library: &ImageLibrary, relative: &str, data: &[u8]) -> NewArtifact {
        let mut sink = library.store().stage().await.unwrap();
        sink.write(data).await.unwrap();
        let staged = sink.finish().await.unwrap();
        library.store().commit(staged, relative).await.unwrap();
        NewArtifact {
            name: "boot-kernel".to_string(),
            ftype: "boot-kernel".to_string(),
            relative_path: relative.to_string(),
            size: data.len() as u64,
            sha256: sha256_hex(data),
            source_url: None,
            item_meta: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let temp_dir = TempDir::new().unwrap();
        let library = library(&temp_dir).await;

        let a = library.create(new_image("p:a", ImageStatus::Pending)).await.unwrap();
        let b = library
            .create(NewImage {
                source: ImageSource::Custom,
                ..new_image("p:b", ImageStatus::Uploading)
            })
            .await
            .unwrap();

        let image = library.get(a).await.unwrap();
        assert_eq!(image.product_id, "p:a");
        assert_eq!(image.status, "pending");
        assert!(image.artifacts.is_empty());

        let all = library.list(&ImageFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, b);

        let custom = library
            .list(&ImageFilter {
                source: Some(ImageSource::Custom),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(custom.len(), 1);
        assert_eq!(custom[0].id, b);

        assert!(matches!(library.get(999).await, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ready_requires_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let library = library(&temp_dir).await;
        let id = library.create(new_image("p:a", ImageStatus::Mirroring)).await.unwrap();

        assert!(matches!(
            library.attach_and_mark_ready(id, vec![]).await,
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            library.update_status(id, ImageStatus::Ready, None).await,
            Err(ServerError::Conflict(_))
        ));
        assert_eq!(library.get(id).await.unwrap().status, "mirroring");
    }

    #[tokio::test]
    async fn test_attach_supersedes_older_image() {
        let temp_dir = TempDir::new().unwrap();
        let library = library(&temp_dir).await;

        let old = library.create(new_image("p:a", ImageStatus::Mirroring)).await.unwrap();
        let old_file = put_file(&library, "mirror/old/boot-kernel", b"old").await;
        library
            .attach_and_mark_ready(old, vec![old_file.clone()])
            .await
            .unwrap();

        let new = library.create(new_image("p:a", ImageStatus::Mirroring)).await.unwrap();
        let new_file = put_file(&library, "mirror/new/boot-kernel", b"new").await;
        let superseded = library
            .attach_and_mark_ready(new, vec![new_file])
            .await
            .unwrap();

        assert_eq!(superseded, vec![old]);
        assert!(matches!(library.get(old).await, Err(ServerError::NotFound(_))));
        assert!(!library
            .store()
            .resolve(&old_file.relative_path)
            .unwrap()
            .exists());

        let image = library.get(new).await.unwrap();
        assert_eq!(image.status, "ready");
        assert_eq!(image.artifacts.len(), 1);
        assert_eq!(image.artifacts[0].kind, "kernel");
        assert_eq!(image.artifacts[0].sha256, sha256_hex(b"new"));
        assert_eq!(image.artifacts[0].download_url, "/uploads/mirror/new/boot-kernel");
    }

    #[tokio::test]
    async fn test_delete_removes_rows_and_files() {
        let temp_dir = TempDir::new().unwrap();
        let library = library(&temp_dir).await;

        let id = library.create(new_image("p:a", ImageStatus::Mirroring)).await.unwrap();
        let file = put_file(&library, "mirror/1/boot-kernel", b"kernel").await;
        library.attach_and_mark_ready(id, vec![file.clone()]).await.unwrap();

        library.delete(id).await.unwrap();
        assert!(matches!(library.get(id).await, Err(ServerError::NotFound(_))));
        assert!(!library.store().resolve(&file.relative_path).unwrap().exists());
        assert!(matches!(library.delete(id).await, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_refuses_in_flight() {
        let temp_dir = TempDir::new().unwrap();
        let library = library(&temp_dir).await;

        let id = library.create(new_image("p:a", ImageStatus::Mirroring)).await.unwrap();
        assert!(matches!(library.delete(id).await, Err(ServerError::Conflict(_))));

        library
            .update_status(id, ImageStatus::Error, Some("boom".into()))
            .await
            .unwrap();
        library.delete(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_filters_statuses() {
        let temp_dir = TempDir::new().unwrap();
        let library = library(&temp_dir).await;

        let ready = library.create(new_image("p:b", ImageStatus::Mirroring)).await.unwrap();
        let file = put_file(&library, "mirror/b/boot-kernel", b"k").await;
        library.attach_and_mark_ready(ready, vec![file]).await.unwrap();
        library.create(new_image("p:a", ImageStatus::Error)).await.unwrap();

        let snapshot = library.snapshot(&[ImageStatus::Ready]).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, ready);

        let both = library
            .snapshot(&[ImageStatus::Ready, ImageStatus::Error])
            .await
            .unwrap();
        assert_eq!(both[0].product_id, "p:a");
        assert!(library.snapshot(&[]).await.unwrap().is_empty());
    }
}
