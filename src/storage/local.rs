//! Local filesystem artifact store.

use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::sink::{HashingSink, StagedFile};
use crate::error::{Result, ServerError};

/// Local filesystem artifact store.
///
/// Layout:
/// ```text
/// {root}/
///   mirror/{image_id}/{upstream item path}
///   custom/{image_id}/{filename}
/// {staging}/
///   {uuid}.part          # in-flight writes, never served
/// ```
///
/// Staged files are moved into place with a rename, so `staging` must live on
/// the same filesystem as `root`.
pub struct ArtifactStore {
    root: PathBuf,
    staging: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, staging: PathBuf) -> Self {
        Self { root, staging }
    }

    /// Open a fresh hashing sink in the staging directory
    pub async fn stage(&self) -> Result<HashingSink> {
        let path = self.staging.join(format!("{}.part", uuid::Uuid::new_v4()));
        HashingSink::create(path)
            .await
            .map_err(|e| ServerError::Storage(format!("Failed to create staging file: {}", e)))
    }

    /// Absolute path for a relative artifact path; rejects anything escaping the root
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let clean = sanitize_relative(relative)
            .ok_or_else(|| ServerError::Storage(format!("Unsafe artifact path: {}", relative)))?;
        Ok(self.root.join(clean))
    }

    /// Atomically move a staged file to its final relative path
    pub async fn commit(&self, staged: StagedFile, relative: &str) -> Result<PathBuf> {
        let dest = match self.resolve(relative) {
            Ok(dest) => dest,
            Err(e) => {
                staged.discard().await;
                return Err(e);
            }
        };

        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                staged.discard().await;
                return Err(ServerError::Storage(format!(
                    "Failed to create {:?}: {}",
                    parent, e
                )));
            }
        }

        if let Err(e) = fs::rename(&staged.path, &dest).await {
            staged.discard().await;
            return Err(ServerError::Storage(format!(
                "Failed to move artifact into {:?} (staging must share a filesystem with the artifact root): {}",
                dest, e
            )));
        }

        Ok(dest)
    }

    /// Remove one artifact file, pruning empty parent directories
    pub async fn remove(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {} // Already deleted
            Err(e) => return Err(ServerError::Io(e)),
        }

        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails on non-empty directories, which ends the walk
            if fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// Remove several artifact files, logging (not returning) failures
    pub async fn remove_all_best_effort(&self, relative_paths: &[String]) {
        for relative in relative_paths {
            if let Err(e) = self.remove(relative).await {
                tracing::warn!("Failed to remove artifact {}: {}", relative, e);
            }
        }
    }

    /// Drop leftovers of writes interrupted by a crash
    pub async fn clear_staging(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.staging).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(ServerError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext == "part").unwrap_or(false)
                && fs::remove_file(&path).await.is_ok()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Normalize an untrusted relative path, keeping only plain components.
///
/// Returns `None` for absolute paths, `..`, or empty results.
pub fn sanitize_relative(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
