//! Simplestream image mirror: browse upstream simplestream trees, mirror
//! selected products into a local library, accept custom image uploads and
//! republish everything as a simplestream tree of our own.

pub mod api;
pub mod config;
pub mod custom;
pub mod db;
pub mod error;
pub mod jobs;
pub mod library;
pub mod publish;
pub mod storage;
pub mod upstream;

pub use api::{build_router, AppState};
pub use config::ServerConfig;
pub use error::{Result, ServerError};
