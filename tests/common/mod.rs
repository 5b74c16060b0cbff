#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use simplestream_mirror::{build_router, AppState, ServerConfig};

pub const STREAM_ID: &str = "com.example:v1:download";
pub const STREAM_PATH: &str = "streams/v1/download.json";

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// One item of an upstream product version
pub struct FakeItem {
    pub name: &'static str,
    pub body: Vec<u8>,
    /// Declared digest; defaults to the real one
    pub sha256: Option<String>,
}

impl FakeItem {
    pub fn new(name: &'static str, body: Vec<u8>) -> Self {
        Self {
            name,
            body,
            sha256: None,
        }
    }
}

/// Fake upstream mirror serving a one-stream simplestream tree
pub struct FakeUpstream {
    pub base: String,
}

impl FakeUpstream {
    pub async fn start(products: Vec<(&'static str, &'static str, Vec<FakeItem>)>) -> Self {
        let mut files: HashMap<String, Vec<u8>> = HashMap::new();
        let mut product_docs = serde_json::Map::new();

        for (product_id, version, items) in &products {
            let mut item_docs = serde_json::Map::new();
            for item in items {
                let path = format!("files/{}/{}", product_id, item.name);
                item_docs.insert(
                    item.name.to_string(),
                    json!({
                        "ftype": item.name,
                        "path": path,
                        "sha256": item.sha256.clone().unwrap_or_else(|| sha256_hex(&item.body)),
                        "size": item.body.len(),
                        "md5": "d41d8cd98f00b204e9800998ecf8427e",
                    }),
                );
                files.insert(format!("/{}", path), item.body.clone());
            }
            product_docs.insert(
                product_id.to_string(),
                json!({
                    "os": "ubuntu",
                    "release": "noble",
                    "release_title": "24.04 LTS",
                    "version": "24.04",
                    "arch": "amd64",
                    "subarch": "ga-24.04",
                    "label": "stable",
                    "support_eol": "2029-05-31",
                    "versions": {
                        *version: { "pubname": format!("{}-{}", product_id, version), "items": item_docs }
                    },
                }),
            );
        }

        let product_ids: Vec<&str> = products.iter().map(|(id, _, _)| *id).collect();
        let index = json!({
            "format": "index:1.0",
            "index": {
                STREAM_ID: {
                    "datatype": "image-ids",
                    "format": "products:1.0",
                    "path": STREAM_PATH,
                    "products": product_ids,
                }
            }
        });
        let stream = json!({
            "content_id": STREAM_ID,
            "datatype": "image-ids",
            "format": "products:1.0",
            "products": product_docs,
        });
        files.insert("/streams/v1/index.json".into(), index.to_string().into_bytes());
        files.insert(format!("/{}", STREAM_PATH), stream.to_string().into_bytes());

        let files = Arc::new(files);
        let app = Router::new().fallback(move |uri: Uri| {
            let files = files.clone();
            async move {
                match files.get(uri.path()) {
                    Some(body) => (StatusCode::OK, body.clone()).into_response(),
                    None => StatusCode::NOT_FOUND.into_response(),
                }
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
        }
    }

    pub fn index_url(&self) -> String {
        format!("{}/streams/v1/index.json", self.base)
    }
}

/// The mirror server running on an ephemeral port
pub struct TestApp {
    pub base: String,
    pub state: Arc<AppState>,
    pub client: reqwest::Client,
    _data_dir: TempDir,
}

impl TestApp {
    pub async fn start() -> Self {
        let data_dir = TempDir::new().unwrap();
        let mut config = ServerConfig::with_data_dir(data_dir.path().to_path_buf());
        config.upstream.allow_private_networks = true;
        config.workers = 2;

        let state = Arc::new(AppState::build(config).await.unwrap());
        let app = build_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            state,
            client: reqwest::Client::new(),
            _data_dir: data_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn get_json(&self, path: &str) -> Value {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        assert!(
            response.status().is_success(),
            "GET {} answered {}",
            path,
            response.status()
        );
        response.json().await.unwrap()
    }

    pub async fn get_bytes(&self, path: &str) -> (StatusCode, Vec<u8>) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        (status, response.bytes().await.unwrap().to_vec())
    }

    pub async fn enqueue(&self, index_url: &str, product_ids: &[&str]) -> Value {
        let response = self
            .client
            .post(self.url("/api/mirror"))
            .json(&json!({ "index_url": index_url, "product_ids": product_ids }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        response.json().await.unwrap()
    }

    /// Poll a job until it reaches a terminal status
    pub async fn wait_for_job(&self, job_id: i64) -> Value {
        for _ in 0..200 {
            let job = self.get_json(&format!("/api/mirror/jobs/{}", job_id)).await;
            if job["status"] == "completed" || job["status"] == "failed" {
                // Workers republish right after the terminal transition
                self.state.publisher.republish().await.unwrap();
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    pub fn job_ids(enqueue_result: &Value) -> HashMap<String, i64> {
        enqueue_result["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|j| {
                (
                    j["product_id"].as_str().unwrap().to_string(),
                    j["job_id"].as_i64().unwrap(),
                )
            })
            .collect()
    }
}
