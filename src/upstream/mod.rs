//! Remote simplestream access: URL guard, client and document types.

pub mod client;
pub mod guard;
pub mod types;

pub use client::{mirror_root, ResolvedProduct, UpstreamClient};
pub use guard::{AuthorizedTarget, UpstreamGuard};
pub use types::{UpstreamArtifact, UpstreamProduct, UpstreamStream};
