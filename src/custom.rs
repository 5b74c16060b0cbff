//! Custom image intake.
//!
//! User-supplied kernels, initrds and root filesystems enter the library as
//! a synthetic product of the local custom stream and are published exactly
//! like mirrored images.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, ServerError};
use crate::library::{
    ImageLibrary, ImageRecord, ImageSource, ImageStatus, Meta, NewArtifact, NewImage,
};
use crate::publish::PublicationEngine;
use crate::storage::StagedFile;

/// Stream every custom image belongs to
pub const CUSTOM_STREAM_ID: &str = "com.local.maas:custom:download";
const PRODUCT_PREFIX: &str = "com.local.maas.custom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadKind {
    Kernel,
    Initrd,
    Rootfs,
    Manifest,
}

impl UploadKind {
    /// Multipart field name -> kind
    pub fn from_field(name: &str) -> Option<Self> {
        match name {
            "kernel" => Some(UploadKind::Kernel),
            "initrd" => Some(UploadKind::Initrd),
            "rootfs" => Some(UploadKind::Rootfs),
            "manifest" => Some(UploadKind::Manifest),
            _ => None,
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            UploadKind::Kernel => "kernel",
            UploadKind::Initrd => "initrd",
            UploadKind::Rootfs => "rootfs",
            UploadKind::Manifest => "manifest",
        }
    }

    /// Simplestream item name, also used as ftype
    pub fn item_name(&self) -> &'static str {
        match self {
            UploadKind::Kernel => "boot-kernel",
            UploadKind::Initrd => "boot-initrd",
            UploadKind::Rootfs => "squashfs",
            UploadKind::Manifest => "manifest",
        }
    }

    /// File name under the image's artifact directory
    pub fn filename(&self) -> &'static str {
        match self {
            UploadKind::Kernel => "boot-kernel",
            UploadKind::Initrd => "boot-initrd",
            UploadKind::Rootfs => "squashfs",
            UploadKind::Manifest => "squashfs.manifest",
        }
    }
}

/// Form fields of a custom upload, as received
#[derive(Debug, Clone, Default)]
pub struct CustomImageMetadata {
    pub name: Option<String>,
    pub os: Option<String>,
    pub release: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub label: Option<String>,
    pub subarch: Option<String>,
    pub subarches: Option<String>,
    pub kflavor: Option<String>,
    pub krel: Option<String>,
    pub release_codename: Option<String>,
    pub description: Option<String>,
}

impl CustomImageMetadata {
    /// Record a text field; returns false for unknown names
    pub fn set_field(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "name" => &mut self.name,
            "os" | "os_name" => &mut self.os,
            "release" => &mut self.release,
            "version" => &mut self.version,
            "arch" => &mut self.arch,
            "label" => &mut self.label,
            "subarch" => &mut self.subarch,
            "subarches" => &mut self.subarches,
            "kflavor" => &mut self.kflavor,
            "krel" => &mut self.krel,
            "release_codename" => &mut self.release_codename,
            "description" => &mut self.description,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// One uploaded file waiting in staging
#[derive(Debug)]
pub struct StagedUpload {
    pub kind: UploadKind,
    pub file: StagedFile,
}

/// Metadata after validation and normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMetadata {
    pub name: String,
    pub os: String,
    pub release: String,
    pub version: String,
    pub arch: String,
    pub label: String,
    pub subarch: Option<String>,
    pub subarches: Option<String>,
    pub kflavor: Option<String>,
    pub krel: Option<String>,
    pub release_codename: Option<String>,
    pub description: Option<String>,
}

impl ValidatedMetadata {
    /// `com.local.maas.custom:v3:<slug>:<release>[:<version>]:<arch>[:<subarch>]`
    pub fn product_id(&self) -> String {
        let mut segments = vec![
            PRODUCT_PREFIX.to_string(),
            "v3".to_string(),
            slugify(&self.name),
            segment(&self.release),
        ];
        let version = segment(&self.version);
        if !segments.contains(&version) {
            segments.push(version);
        }
        segments.push(segment(&self.arch));
        if let Some(subarch) = &self.subarch {
            segments.push(segment(subarch));
        }
        segments.join(":")
    }
}

fn segment(value: &str) -> String {
    value.replace(' ', "-")
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Lowercase, runs of anything but `[a-z0-9]` collapsed to `-`
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "image".to_string()
    } else {
        slug.to_string()
    }
}

/// Split on commas and whitespace, drop duplicates, rejoin with commas
pub fn normalize_subarches(raw: &str) -> Option<String> {
    let mut seen = HashSet::new();
    let parts: Vec<&str> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(*t))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

/// Check an upload before anything reaches the library
pub fn validate(metadata: &CustomImageMetadata, kinds: &[UploadKind]) -> Result<ValidatedMetadata> {
    let mut seen = HashSet::new();
    for kind in kinds {
        if !seen.insert(*kind) {
            return Err(ServerError::Validation(format!(
                "{} was uploaded more than once",
                kind.field()
            )));
        }
    }

    if !seen.contains(&UploadKind::Kernel)
        && !seen.contains(&UploadKind::Initrd)
        && !seen.contains(&UploadKind::Rootfs)
    {
        return Err(ServerError::Validation(
            "upload at least one of kernel, initrd or rootfs".into(),
        ));
    }
    if seen.contains(&UploadKind::Rootfs) && !seen.contains(&UploadKind::Manifest) {
        return Err(ServerError::Validation(
            "upload the matching manifest alongside the root filesystem".into(),
        ));
    }

    let (name, release, version, arch) = match (
        clean(&metadata.name),
        clean(&metadata.release),
        clean(&metadata.version),
        clean(&metadata.arch),
    ) {
        (Some(n), Some(r), Some(v), Some(a)) => (n, r, v, a),
        _ => {
            return Err(ServerError::Validation(
                "name, release, version and arch are required".into(),
            ))
        }
    };

    Ok(ValidatedMetadata {
        name,
        release,
        version,
        arch,
        os: clean(&metadata.os).unwrap_or_else(|| "custom".to_string()),
        label: clean(&metadata.label).unwrap_or_else(|| "custom".to_string()),
        subarch: clean(&metadata.subarch),
        subarches: metadata.subarches.as_deref().and_then(normalize_subarches),
        kflavor: clean(&metadata.kflavor),
        krel: clean(&metadata.krel),
        release_codename: clean(&metadata.release_codename),
        description: clean(&metadata.description),
    })
}

pub struct CustomIntake {
    library: Arc<ImageLibrary>,
    publisher: Arc<PublicationEngine>,
}

impl CustomIntake {
    pub fn new(library: Arc<ImageLibrary>, publisher: Arc<PublicationEngine>) -> Self {
        Self { library, publisher }
    }

    /// Turn staged uploads into a ready custom image and republish.
    ///
    /// Staged files are consumed: committed on success, discarded otherwise.
    pub async fn ingest(
        &self,
        metadata: CustomImageMetadata,
        uploads: Vec<StagedUpload>,
    ) -> Result<ImageRecord> {
        let kinds: Vec<UploadKind> = uploads.iter().map(|u| u.kind).collect();
        let meta = match validate(&metadata, &kinds) {
            Ok(meta) => meta,
            Err(e) => {
                discard_all(uploads).await;
                return Err(e);
            }
        };

        let product_id = meta.product_id();
        let build_id = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut version_meta = Meta::new();
        if let Some(description) = &meta.description {
            version_meta.insert("description".into(), Value::String(description.clone()));
        }

        let created = self
            .library
            .create(NewImage {
                product_id: product_id.clone(),
                stream_id: CUSTOM_STREAM_ID.to_string(),
                name: meta.name.clone(),
                source: ImageSource::Custom,
                status: ImageStatus::Uploading,
                status_detail: Some("Storing uploaded artifacts".to_string()),
                origin_index_url: None,
                os: Some(meta.os.clone()),
                release: Some(meta.release.clone()),
                release_title: Some(meta.release.clone()),
                release_codename: meta.release_codename.clone(),
                version: Some(meta.version.clone()),
                arch: Some(meta.arch.clone()),
                subarch: meta.subarch.clone(),
                subarches: meta.subarches.clone(),
                label: Some(meta.label.clone()),
                kflavor: meta.kflavor.clone(),
                krel: meta.krel.clone(),
                build_id: Some(build_id),
                product_meta: Meta::new(),
                version_meta,
            })
            .await;
        let image_id = match created {
            Ok(id) => id,
            Err(e) => {
                discard_all(uploads).await;
                return Err(e);
            }
        };

        let mut pending = uploads.into_iter();
        let mut committed: Vec<String> = Vec::new();
        let placed: Result<()> = async {
            let mut artifacts = Vec::new();
            for upload in pending.by_ref() {
                let relative = format!("custom/{}/{}", image_id, upload.kind.filename());
                let size = upload.file.size;
                let sha256 = upload.file.sha256.clone();
                self.library.store().commit(upload.file, &relative).await?;
                committed.push(relative.clone());
                artifacts.push(NewArtifact {
                    name: upload.kind.item_name().to_string(),
                    ftype: upload.kind.item_name().to_string(),
                    relative_path: relative,
                    size,
                    sha256,
                    source_url: None,
                    item_meta: Meta::new(),
                });
            }
            self.library.attach_and_mark_ready(image_id, artifacts).await?;
            Ok(())
        }
        .await;

        if let Err(e) = placed {
            discard_all(pending.collect()).await;
            self.library.store().remove_all_best_effort(&committed).await;
            if let Err(mark) = self
                .library
                .update_status(image_id, ImageStatus::Error, Some(e.to_string()))
                .await
            {
                tracing::error!("Failed to mark image {} as error: {}", image_id, mark);
            }
            return Err(e);
        }

        tracing::info!("Custom image {} stored as {}", image_id, product_id);

        if let Err(e) = self.publisher.republish().await {
            tracing::error!("Republish after custom upload {} failed: {}", image_id, e);
        }

        self.library.get(image_id).await
    }
}

async fn discard_all(uploads: Vec<StagedUpload>) {
    for upload in uploads {
        upload.file.discard().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use crate::library::ImageFilter;
    use crate::storage::sink::sha256_hex;
    use crate::storage::ArtifactStore;
    use tempfile::TempDir;

    fn metadata() -> CustomImageMetadata {
        CustomImageMetadata {
            name: Some("My Image".into()),
            release: Some("noble".into()),
            version: Some("24.04".into()),
            arch: Some("amd64".into()),
            subarch: Some("generic".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Image"), "my-image");
        assert_eq!(slugify("  Ubuntu 24.04 / Custom!! "), "ubuntu-24-04-custom");
        assert_eq!(slugify("***"), "image");
    }

    #[test]
    fn test_normalize_subarches() {
        assert_eq!(
            normalize_subarches("ga-24.04, hwe-24.04 ga-24.04,,").as_deref(),
            Some("ga-24.04,hwe-24.04")
        );
        assert_eq!(normalize_subarches(" , "), None);
    }

    #[test]
    fn test_product_id() {
        let meta = validate(&metadata(), &[UploadKind::Kernel]).unwrap();
        assert_eq!(meta.os, "custom");
        assert_eq!(meta.label, "custom");
        assert_eq!(
            meta.product_id(),
            "com.local.maas.custom:v3:my-image:noble:24.04:amd64:generic"
        );

        let same_version = validate(
            &CustomImageMetadata {
                release: Some("24.04".into()),
                subarch: None,
                ..metadata()
            },
            &[UploadKind::Kernel],
        )
        .unwrap();
        assert_eq!(
            same_version.product_id(),
            "com.local.maas.custom:v3:my-image:24.04:amd64"
        );
    }

    #[test]
    fn test_validation_rules() {
        let meta = metadata();
        let err = |kinds: &[UploadKind]| matches!(validate(&meta, kinds), Err(ServerError::Validation(_)));

        assert!(err(&[]));
        assert!(err(&[UploadKind::Manifest]));
        assert!(err(&[UploadKind::Rootfs]));
        assert!(err(&[UploadKind::Kernel, UploadKind::Kernel]));
        assert!(!err(&[UploadKind::Rootfs, UploadKind::Manifest]));
        assert!(!err(&[UploadKind::Initrd]));

        let missing = CustomImageMetadata {
            arch: Some("   ".into()),
            ..metadata()
        };
        assert!(matches!(
            validate(&missing, &[UploadKind::Kernel]),
            Err(ServerError::Validation(_))
        ));
    }

    #[test]
    fn test_set_field() {
        let mut meta = CustomImageMetadata::default();
        assert!(meta.set_field("os_name", "ubuntu".into()));
        assert!(meta.set_field("kflavor", "generic".into()));
        assert!(meta.set_field("description", "nightly".into()));
        assert!(!meta.set_field("bogus", "x".into()));
        assert_eq!(meta.os.as_deref(), Some("ubuntu"));
        assert_eq!(meta.description.as_deref(), Some("nightly"));
    }

    struct Harness {
        _temp_dir: TempDir,
        library: Arc<ImageLibrary>,
        intake: CustomIntake,
        publish_root: std::path::PathBuf,
    }

    async fn harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let db = init_database(&temp_dir.path().join("library.db")).await.unwrap();
        let store = Arc::new(ArtifactStore::new(
            temp_dir.path().join("uploads"),
            temp_dir.path().join("staging"),
        ));
        let library = Arc::new(ImageLibrary::new(Arc::new(db), store));
        let publish_root = temp_dir.path().join("published");
        let publisher = Arc::new(PublicationEngine::new(
            library.clone(),
            publish_root.clone(),
            vec![ImageStatus::Ready],
        ));
        Harness {
            intake: CustomIntake::new(library.clone(), publisher),
            library,
            publish_root,
            _temp_dir: temp_dir,
        }
    }

    async fn staged(library: &ImageLibrary, kind: UploadKind, data: &[u8]) -> StagedUpload {
        let mut sink = library.store().stage().await.unwrap();
        sink.write(data).await.unwrap();
        StagedUpload {
            kind,
            file: sink.finish().await.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_ingest_publishes_ready_image() {
        let h = harness().await;
        let uploads = vec![
            staged(&h.library, UploadKind::Kernel, b"kernel").await,
            staged(&h.library, UploadKind::Rootfs, b"rootfs").await,
            staged(&h.library, UploadKind::Manifest, b"manifest").await,
        ];

        let with_description = CustomImageMetadata {
            description: Some("  Lab build with debug kernel ".into()),
            ..metadata()
        };
        let image = h.intake.ingest(with_description, uploads).await.unwrap();
        assert_eq!(image.status, "ready");
        assert_eq!(image.source, "custom");
        assert_eq!(image.stream_id, CUSTOM_STREAM_ID);
        assert_eq!(image.artifacts.len(), 3);

        let manifest = image.artifacts.iter().find(|a| a.name == "manifest").unwrap();
        assert_eq!(manifest.relative_path, format!("custom/{}/squashfs.manifest", image.id));
        assert_eq!(manifest.sha256, sha256_hex(b"manifest"));
        assert!(h.library.store().resolve(&manifest.relative_path).unwrap().exists());

        let products = std::fs::read(
            h.publish_root
                .join(crate::publish::products_path(CUSTOM_STREAM_ID)),
        )
        .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&products).unwrap();
        let versions = &doc["products"][image.product_id.as_str()]["versions"];
        let build_id = image.build_id.as_deref().unwrap();
        assert_eq!(versions[build_id]["description"], "Lab build with debug kernel");
        assert!(versions[build_id]["items"]["manifest"].is_object());
    }

    #[tokio::test]
    async fn test_rejected_upload_leaves_library_unchanged() {
        let h = harness().await;
        let rootfs = staged(&h.library, UploadKind::Rootfs, b"rootfs").await;
        let staged_path = rootfs.file.path.clone();

        let err = h.intake.ingest(metadata(), vec![rootfs]).await.unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
        assert!(!staged_path.exists());
        assert!(h.library.list(&ImageFilter::default()).await.unwrap().is_empty());
    }
}
