//! Image library: the durable record of every image and its artifacts.

mod store;

pub use store::ImageLibrary;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::entities::{artifact, image};

/// Free-form simplestream fields carried through to publication
pub type Meta = BTreeMap<String, Value>;

/// Stored form of a [`Meta`]; empty maps are not stored
pub fn encode_meta(meta: &Meta) -> Option<String> {
    if meta.is_empty() {
        return None;
    }
    serde_json::to_string(meta).ok()
}

/// Parse a stored [`Meta`], treating anything unreadable as empty
pub fn decode_meta(raw: Option<&str>) -> Meta {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    #[default]
    Pending,
    Mirroring,
    Uploading,
    Ready,
    Error,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Mirroring => "mirroring",
            ImageStatus::Uploading => "uploading",
            ImageStatus::Ready => "ready",
            ImageStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ImageStatus::Pending),
            "mirroring" => Some(ImageStatus::Mirroring),
            "uploading" => Some(ImageStatus::Uploading),
            "ready" => Some(ImageStatus::Ready),
            "error" => Some(ImageStatus::Error),
            _ => None,
        }
    }

    /// Statuses owned by a worker or upload still in progress
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ImageStatus::Pending | ImageStatus::Mirroring | ImageStatus::Uploading
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    #[default]
    Mirrored,
    Custom,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Mirrored => "mirrored",
            ImageSource::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mirrored" => Some(ImageSource::Mirrored),
            "custom" => Some(ImageSource::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Kernel,
    Initrd,
    Rootfs,
    Manifest,
    Other,
}

impl ArtifactKind {
    /// Classify a simplestream `ftype`
    pub fn from_ftype(ftype: &str) -> Self {
        match ftype {
            "boot-kernel" => ArtifactKind::Kernel,
            "boot-initrd" => ArtifactKind::Initrd,
            "squashfs" | "root-image.gz" | "root-tgz" | "root-tbz" | "root-txz" | "root-dd"
            | "root-image" => ArtifactKind::Rootfs,
            f if f.starts_with("root-") => ArtifactKind::Rootfs,
            f if f.ends_with("manifest") => ArtifactKind::Manifest,
            _ => ArtifactKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Kernel => "kernel",
            ArtifactKind::Initrd => "initrd",
            ArtifactKind::Rootfs => "rootfs",
            ArtifactKind::Manifest => "manifest",
            ArtifactKind::Other => "other",
        }
    }
}

/// Fields of an image about to be created
#[derive(Debug, Clone, Default)]
pub struct NewImage {
    pub product_id: String,
    pub stream_id: String,
    pub name: String,
    pub source: ImageSource,
    pub status: ImageStatus,
    pub status_detail: Option<String>,
    pub origin_index_url: Option<String>,
    pub os: Option<String>,
    pub release: Option<String>,
    pub release_title: Option<String>,
    pub release_codename: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub subarch: Option<String>,
    pub subarches: Option<String>,
    pub label: Option<String>,
    pub kflavor: Option<String>,
    pub krel: Option<String>,
    pub build_id: Option<String>,
    /// Product-level fields published as-is (upstream entry minus `versions`)
    pub product_meta: Meta,
    /// Version-level fields published as-is (minus `items`)
    pub version_meta: Meta,
}

/// A verified file to attach to an image
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub name: String,
    pub ftype: String,
    pub relative_path: String,
    pub size: u64,
    pub sha256: String,
    pub source_url: Option<String>,
    /// Item keys besides ftype/path/sha256/size
    pub item_meta: Meta,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub id: i32,
    pub name: String,
    pub kind: String,
    pub ftype: String,
    pub relative_path: String,
    pub size: u64,
    pub sha256: String,
    pub source_url: Option<String>,
    pub download_url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub item_meta: Meta,
}

impl From<artifact::Model> for ArtifactRecord {
    fn from(m: artifact::Model) -> Self {
        Self {
            download_url: format!("/uploads/{}", m.relative_path),
            item_meta: decode_meta(m.item_meta.as_deref()),
            id: m.id,
            name: m.name,
            kind: m.kind,
            ftype: m.ftype,
            relative_path: m.relative_path,
            size: m.size.max(0) as u64,
            sha256: m.sha256,
            source_url: m.source_url,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    pub id: i32,
    pub product_id: String,
    pub stream_id: String,
    pub name: String,
    pub source: String,
    pub status: String,
    pub status_detail: Option<String>,
    pub origin_index_url: Option<String>,
    pub os: Option<String>,
    pub release: Option<String>,
    pub release_title: Option<String>,
    pub release_codename: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub subarch: Option<String>,
    pub subarches: Option<String>,
    pub label: Option<String>,
    pub kflavor: Option<String>,
    pub krel: Option<String>,
    pub build_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub product_meta: Meta,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub version_meta: Meta,
    pub created_at: i64,
    pub updated_at: i64,
    pub artifacts: Vec<ArtifactRecord>,
}

impl ImageRecord {
    pub fn from_models(m: image::Model, artifacts: Vec<artifact::Model>) -> Self {
        Self {
            id: m.id,
            product_id: m.product_id,
            stream_id: m.stream_id,
            name: m.name,
            source: m.source,
            status: m.status,
            status_detail: m.status_detail,
            origin_index_url: m.origin_index_url,
            os: m.os,
            release: m.release,
            release_title: m.release_title,
            release_codename: m.release_codename,
            version: m.version,
            arch: m.arch,
            subarch: m.subarch,
            subarches: m.subarches,
            label: m.label,
            kflavor: m.kflavor,
            krel: m.krel,
            build_id: m.build_id,
            product_meta: decode_meta(m.product_meta.as_deref()),
            version_meta: decode_meta(m.version_meta.as_deref()),
            created_at: m.created_at,
            updated_at: m.updated_at,
            artifacts: artifacts.into_iter().map(ArtifactRecord::from).collect(),
        }
    }

    pub fn status(&self) -> Option<ImageStatus> {
        ImageStatus::parse(&self.status)
    }
}

/// Optional filters for [`ImageLibrary::list`]
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub status: Option<ImageStatus>,
    pub source: Option<ImageSource>,
}
