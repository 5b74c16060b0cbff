//! Publication engine.
//!
//! Regenerates the simplestream tree served under `/streams` from the image
//! library. Output is a pure function of the library contents, so two runs
//! over the same library produce byte-identical files.
//!
//! Layout under the publish root:
//! ```text
//! streams/v1/index.json
//! streams/v1/{stream_id}/products.json
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Result, ServerError};
use crate::library::{ArtifactRecord, ImageLibrary, ImageRecord, ImageStatus, Meta};
use crate::storage::sink::sha256_hex;

pub const INDEX_PATH: &str = "streams/v1/index.json";
pub const RFC_1123_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";

/// Rendered documents, keyed by path relative to the publish root
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PublishedTree {
    pub products: BTreeMap<String, Vec<u8>>,
    pub index: Vec<u8>,
    /// Directory names under `streams/v1` that belong to this generation
    pub stream_dirs: BTreeSet<String>,
}

#[derive(Serialize)]
struct ProductsDoc<'a> {
    content_id: &'a str,
    datatype: &'static str,
    format: &'static str,
    products: BTreeMap<&'a str, BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<String>,
}

#[derive(Serialize)]
struct IndexStreamDoc<'a> {
    content_id: &'a str,
    datatype: &'static str,
    format: &'static str,
    path: String,
    products: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<String>,
}

#[derive(Serialize)]
struct IndexDoc<'a> {
    format: &'static str,
    index: BTreeMap<&'a str, IndexStreamDoc<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<String>,
}

/// Format unix seconds as RFC 1123
pub fn rfc1123(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .format(RFC_1123_FORMAT)
        .to_string()
}

/// Directory name for a stream id.
///
/// Ids that are already safe path segments are used as-is. Anything else is
/// sanitized to `[A-Za-z0-9._:-]` and suffixed with a digest of the raw id,
/// so `a/b` and `a_b` land in different directories.
pub fn stream_dir(stream_id: &str) -> String {
    let cleaned: String = stream_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if !cleaned.is_empty() && cleaned == stream_id {
        return cleaned.to_string();
    }

    let digest = sha256_hex(stream_id.as_bytes());
    let prefix = if cleaned.is_empty() { "_" } else { cleaned };
    format!("{}-{}", prefix, &digest[..8])
}

/// Path of a stream's products document, relative to the publish root
pub fn products_path(stream_id: &str) -> String {
    format!("streams/v1/{}/products.json", stream_dir(stream_id))
}

/// Assign every stream a distinct directory; ids are visited in order so the
/// result does not depend on library order
fn assign_stream_dirs<'a>(stream_ids: impl Iterator<Item = &'a str>) -> BTreeMap<&'a str, String> {
    let mut taken = BTreeSet::new();
    let mut dirs = BTreeMap::new();
    for stream_id in stream_ids {
        let base = stream_dir(stream_id);
        let mut dir = base.clone();
        let mut n = 1;
        while !taken.insert(dir.clone()) {
            n += 1;
            dir = format!("{}-{}", base, n);
        }
        dirs.insert(stream_id, dir);
    }
    dirs
}

/// Stored metadata minus nulls and the keys the document structure owns
fn passthrough(meta: &Meta, reserved: &[&str]) -> BTreeMap<String, Value> {
    meta.iter()
        .filter(|(k, v)| !v.is_null() && !reserved.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn item_doc(artifact: &ArtifactRecord) -> Value {
    let mut item = passthrough(&artifact.item_meta, &[]);
    item.insert("ftype".into(), Value::String(artifact.ftype.clone()));
    item.insert(
        "path".into(),
        Value::String(format!("uploads/{}", artifact.relative_path)),
    );
    item.insert("sha256".into(), Value::String(artifact.sha256.clone()));
    item.insert("size".into(), Value::from(artifact.size));
    Value::Object(item.into_iter().collect())
}

fn product_entry(images: &[&ImageRecord]) -> BTreeMap<String, Value> {
    let mut entry = BTreeMap::new();

    // Newest image supplies the product metadata
    let newest = images
        .iter()
        .max_by_key(|i| (i.updated_at, i.id))
        .copied();
    if let Some(image) = newest {
        entry = passthrough(&image.product_meta, &["versions"]);
        let fields: [(&str, &Option<String>); 11] = [
            ("os", &image.os),
            ("release", &image.release),
            ("release_title", &image.release_title),
            ("release_codename", &image.release_codename),
            ("version", &image.version),
            ("arch", &image.arch),
            ("subarch", &image.subarch),
            ("subarches", &image.subarches),
            ("label", &image.label),
            ("kflavor", &image.kflavor),
            ("krel", &image.krel),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                entry.insert(key.to_string(), Value::String(v.clone()));
            }
        }
    }

    let mut ordered: Vec<&&ImageRecord> = images.iter().collect();
    ordered.sort_by_key(|i| (i.updated_at, i.id));

    let mut versions = serde_json::Map::new();
    for image in ordered {
        let key = image
            .build_id
            .clone()
            .unwrap_or_else(|| format!("image-{}", image.id));
        let items: BTreeMap<&str, Value> = image
            .artifacts
            .iter()
            .map(|a| (a.name.as_str(), item_doc(a)))
            .collect();

        let mut version = passthrough(&image.version_meta, &["items"]);
        version.insert(
            "items".into(),
            Value::Object(items.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
        );
        // Later (newer) images win a shared version key
        versions.insert(key, Value::Object(version.into_iter().collect()));
    }
    entry.insert("versions".into(), Value::Object(versions));

    entry
}

/// Render the whole published tree from a library snapshot
pub fn build_tree(images: &[ImageRecord]) -> Result<PublishedTree> {
    // stream -> product -> images
    let mut grouped: BTreeMap<&str, BTreeMap<&str, Vec<&ImageRecord>>> = BTreeMap::new();
    for image in images.iter().filter(|i| !i.artifacts.is_empty()) {
        grouped
            .entry(image.stream_id.as_str())
            .or_default()
            .entry(image.product_id.as_str())
            .or_default()
            .push(image);
    }

    let dirs = assign_stream_dirs(grouped.keys().copied());
    let mut tree = PublishedTree::default();
    let mut index = BTreeMap::new();
    let mut newest_overall: Option<i64> = None;

    for (&stream_id, products) in &grouped {
        let newest = products
            .values()
            .flatten()
            .map(|i| i.updated_at)
            .max();
        newest_overall = newest_overall.max(newest);

        let doc = ProductsDoc {
            content_id: stream_id,
            datatype: "image-ids",
            format: "products:1.0",
            products: products
                .iter()
                .map(|(pid, images)| (*pid, product_entry(images)))
                .collect(),
            updated: newest.map(rfc1123),
        };
        let dir = dirs
            .get(stream_id)
            .cloned()
            .unwrap_or_else(|| stream_dir(stream_id));
        let path = format!("streams/v1/{}/products.json", dir);
        tree.products.insert(path.clone(), render(&doc)?);
        tree.stream_dirs.insert(dir);

        index.insert(
            stream_id,
            IndexStreamDoc {
                content_id: stream_id,
                datatype: "image-ids",
                format: "products:1.0",
                path,
                products: products.keys().copied().collect(),
                updated: newest.map(rfc1123),
            },
        );
    }

    tree.index = render(&IndexDoc {
        format: "index:1.0",
        index,
        updated: newest_overall.map(rfc1123),
    })?;
    Ok(tree)
}

fn render<T: Serialize>(doc: &T) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec_pretty(doc)
        .map_err(|e| ServerError::Storage(format!("failed to render document: {}", e)))?;
    out.push(b'\n');
    Ok(out)
}

/// Write `data` to `path` through a temp file and rename
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Ok(existing) = fs::read(path).await {
        if existing == data {
            return Ok(());
        }
    }

    let dir = path
        .parent()
        .ok_or_else(|| ServerError::Storage(format!("{:?} has no parent", path)))?;
    fs::create_dir_all(dir).await?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

    let written: std::io::Result<()> = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(ServerError::Storage(format!("failed to write {:?}: {}", tmp, e)));
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(ServerError::Storage(format!("failed to replace {:?}: {}", path, e)));
    }
    Ok(())
}

pub struct PublicationEngine {
    library: Arc<ImageLibrary>,
    root: PathBuf,
    statuses: Vec<ImageStatus>,
    /// Last ticket handed out
    requested: AtomicU64,
    /// Highest ticket a finished generation covers; held while generating
    completed: Mutex<u64>,
}

impl PublicationEngine {
    pub fn new(library: Arc<ImageLibrary>, root: PathBuf, statuses: Vec<ImageStatus>) -> Self {
        Self {
            library,
            root,
            statuses,
            requested: AtomicU64::new(0),
            completed: Mutex::new(0),
        }
    }

    /// Regenerate the published tree.
    ///
    /// Callers that arrive while a generation is running wait for it; if a
    /// generation started after their call already finished, they return
    /// without generating again.
    pub async fn republish(&self) -> Result<()> {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let mut completed = self.completed.lock().await;
        if *completed >= ticket {
            tracing::debug!("Republish ticket {} already covered", ticket);
            return Ok(());
        }

        // Every ticket issued before the snapshot is read is covered by it
        let covers = self.requested.load(Ordering::SeqCst);
        match self.generate().await {
            Ok(()) => {
                *completed = covers;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Republish failed, previous generation kept: {}", e);
                Err(e)
            }
        }
    }

    async fn generate(&self) -> Result<()> {
        let images = self.library.snapshot(&self.statuses).await?;
        let tree = build_tree(&images)?;

        for (relative, data) in &tree.products {
            write_atomic(&self.root.join(relative), data).await?;
        }
        write_atomic(&self.root.join(INDEX_PATH), &tree.index).await?;

        self.prune(&tree.stream_dirs).await;

        tracing::info!(
            "Published {} streams ({} images)",
            tree.stream_dirs.len(),
            images.len()
        );
        Ok(())
    }

    /// Remove stream directories the new index no longer references
    async fn prune(&self, keep: &BTreeSet<String>) {
        let v1 = self.root.join("streams").join("v1");
        let mut entries = match fs::read_dir(&v1).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || keep.contains(&name) {
                continue;
            }
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => tracing::debug!("Pruned stale stream directory {}", name),
                Err(e) => tracing::warn!("Failed to prune {}: {}", name, e),
            }
        }
    }
}
