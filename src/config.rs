//! Server configuration.
//!
//! Everything is read from the environment once at startup. Unset variables
//! fall back to defaults rooted in the data directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::library::ImageStatus;

/// Default number of concurrent mirror workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default per-request upstream timeout (seconds)
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 900;

/// Default upload body limit (16GB, root filesystems are large)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024 * 1024;

/// Options controlling outbound requests to upstream mirrors
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// User-Agent header sent upstream
    pub user_agent: String,
    /// Allow loopback/private/link-local destinations (lab setups and tests)
    pub allow_private_networks: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            user_agent: format!("simplestream-mirror/{}", env!("CARGO_PKG_VERSION")),
            allow_private_networks: false,
        }
    }
}

/// Top-level server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Root of the artifact tree (served under /uploads)
    pub artifact_root: PathBuf,
    /// In-flight artifact writes; must share a filesystem with `artifact_root`
    pub staging_dir: PathBuf,
    /// Root of the published protocol tree (contains streams/v1)
    pub publish_root: PathBuf,
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,
    /// Size of the mirror worker pool
    pub workers: usize,
    /// Upstream request options
    pub upstream: UpstreamConfig,
    /// Image statuses included in the published tree
    pub publish_statuses: Vec<ImageStatus>,
    /// Maximum accepted request body for custom uploads
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    /// Create config with every root placed under `data_dir`
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("library.db"),
            artifact_root: data_dir.join("uploads"),
            staging_dir: data_dir.join("staging"),
            publish_root: data_dir.join("published"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            workers: DEFAULT_WORKERS,
            upstream: UpstreamConfig::default(),
            publish_statuses: vec![ImageStatus::Ready],
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    /// Load configuration from `SSM_*` environment variables
    pub fn from_env() -> Self {
        let data_dir = env_var("SSM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));

        let mut config = Self::with_data_dir(data_dir);

        if let Some(path) = env_var("SSM_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = env_var("SSM_ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(path);
        }
        if let Some(path) = env_var("SSM_STAGING_DIR") {
            config.staging_dir = PathBuf::from(path);
        }
        if let Some(path) = env_var("SSM_PUBLISH_ROOT") {
            config.publish_root = PathBuf::from(path);
        }
        if let Some(addr) = env_var("SSM_BIND_ADDR") {
            match addr.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(e) => tracing::warn!("Ignoring invalid SSM_BIND_ADDR {:?}: {}", addr, e),
            }
        }
        if let Some(workers) = env_parse::<usize>("SSM_WORKERS") {
            config.workers = workers.max(1);
        }
        if let Some(secs) = env_parse::<u64>("SSM_UPSTREAM_TIMEOUT_SECS") {
            config.upstream.timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(agent) = env_var("SSM_USER_AGENT") {
            config.upstream.user_agent = agent;
        }
        if let Some(allow) = env_var("SSM_ALLOW_PRIVATE_UPSTREAMS") {
            config.upstream.allow_private_networks = parse_bool(&allow);
        }
        if let Some(statuses) = env_var("SSM_PUBLISH_STATUSES") {
            let parsed = parse_statuses(&statuses);
            if parsed.is_empty() {
                tracing::warn!("SSM_PUBLISH_STATUSES has no known statuses, publishing ready images only");
            } else {
                config.publish_statuses = parsed;
            }
        }
        if let Some(limit) = env_parse::<usize>("SSM_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = limit;
        }

        config
    }

    /// Create every directory the server writes into
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&self.artifact_root)?;
        std::fs::create_dir_all(&self.staging_dir)?;
        std::fs::create_dir_all(self.publish_root.join("streams").join("v1"))?;
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_statuses(raw: &str) -> Vec<ImageStatus> {
    let mut statuses = Vec::new();
    for token in raw.split(',') {
        if let Some(status) = ImageStatus::parse(token.trim()) {
            if !statuses.contains(&status) {
                statuses.push(status);
            }
        }
    }
    statuses
}
