//! Artifact storage.
//!
//! - [`sink`]: hash-while-write staging files
//! - [`local`]: the on-disk artifact tree served under `/uploads`
//! - [`fetcher`]: streaming, verified downloads from upstream mirrors

pub mod fetcher;
pub mod local;
pub mod sink;

pub use fetcher::{ArtifactFetcher, Expected, FetchedArtifact, NoProgress, ProgressObserver};
pub use local::{sanitize_relative, ArtifactStore};
pub use sink::{HashingSink, StagedFile};
