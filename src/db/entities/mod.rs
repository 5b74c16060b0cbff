//! Database entities

pub mod artifact;
pub mod image;
pub mod mirror_job;

pub use artifact::Entity as Artifact;
pub use image::Entity as Image;
pub use mirror_job::Entity as MirrorJob;
