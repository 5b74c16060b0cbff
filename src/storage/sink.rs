//! Hash-while-write sink.
//!
//! Every artifact byte, whether it arrives from an upstream mirror or from a
//! multipart upload, goes through a [`HashingSink`]: one pass feeds both the
//! SHA-256 accumulator and the staging file, so nothing is buffered whole.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Render a digest as lowercase hex
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 of an in-memory buffer, as hex
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// A staging file being written while its digest is computed
pub struct HashingSink {
    file: fs::File,
    hasher: Sha256,
    written: u64,
    path: PathBuf,
}

impl HashingSink {
    /// Create (truncate) the staging file at `path`
    pub async fn create(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(&path).await?;
        Ok(Self {
            file,
            hasher: Sha256::new(),
            written: 0,
            path,
        })
    }

    /// Append a chunk to the file and the digest
    pub async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and fsync, returning the staged file with its size and digest
    pub async fn finish(mut self) -> std::io::Result<StagedFile> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let sha256 = to_hex(&self.hasher.finalize());
        Ok(StagedFile {
            path: self.path,
            size: self.written,
            sha256,
        })
    }

    /// Drop the partially written file
    pub async fn abort(self) {
        let path = self.path;
        drop(self.file);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove staging file {:?}: {}", path, e);
            }
        }
    }
}

/// A fully written, hashed file waiting in the staging directory
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

impl StagedFile {
    /// Remove the staged file without committing it
    pub async fn discard(self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to discard staged file {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sink_hashes_what_it_writes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("file.part");

        let mut sink = HashingSink::create(path.clone()).await.unwrap();
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        assert_eq!(sink.written(), 11);

        let staged = sink.finish().await.unwrap();
        assert_eq!(staged.size, 11);
        assert_eq!(staged.sha256, sha256_hex(b"hello world"));
        assert_eq!(
            staged.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(fs::read(&path).await.unwrap(), b"hello world");

        staged.discard().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_abort_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("aborted.part");

        let mut sink = HashingSink::create(path.clone()).await.unwrap();
        sink.write(b"partial").await.unwrap();
        sink.abort().await;

        assert!(!path.exists());
    }
}
