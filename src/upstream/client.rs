//! Simplestream client.
//!
//! All requests go through [`UpstreamClient::send`], which authorizes every
//! hop with the guard, pins the connection to the addresses the guard
//! validated and follows redirects by hand.

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::{redirect::Policy, Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::guard::{AuthorizedTarget, UpstreamGuard};
use super::types::{
    IndexDocument, IndexEntry, ItemEntry, ProductEntry, ProductsDocument, UpstreamProduct,
    UpstreamStream,
};
use crate::config::UpstreamConfig;
use crate::error::{Result, ServerError};

/// Redirect hops followed before giving up
pub const MAX_REDIRECTS: usize = 10;

/// A product resolved at its latest version, ready to be mirrored
#[derive(Debug, Clone)]
pub struct ResolvedProduct {
    pub stream_id: String,
    pub stream_path: String,
    pub product_id: String,
    pub entry: ProductEntry,
    pub version: String,
    /// Fields of the chosen version besides `items`
    pub version_meta: BTreeMap<String, Value>,
    pub items: Vec<(String, ItemEntry)>,
    /// Base URL every item path is relative to
    pub mirror_root: Url,
}

impl ResolvedProduct {
    /// Absolute URL of an item
    pub fn item_url(&self, item: &ItemEntry) -> Result<Url> {
        self.mirror_root
            .join(item.path.trim_start_matches('/'))
            .map_err(|e| ServerError::ProtocolParse(format!("bad item path {:?}: {}", item.path, e)))
    }
}

pub struct UpstreamClient {
    guard: Arc<UpstreamGuard>,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(guard: Arc<UpstreamGuard>, config: UpstreamConfig) -> Self {
        Self { guard, config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Build a client whose DNS for the target host is pinned to the validated addresses
    fn pinned_client(&self, target: &AuthorizedTarget) -> Result<Client> {
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(self.config.timeout)
            .user_agent(self.config.user_agent.clone());
        if target.url.domain().is_some() {
            builder = builder.resolve_to_addrs(&target.host, &target.addrs);
        }
        builder
            .build()
            .map_err(|e| ServerError::UpstreamUnreachable(format!("failed to build HTTP client: {}", e)))
    }

    /// GET `url`, following redirects manually and re-authorizing every hop.
    ///
    /// Non-2xx responses are errors. The returned response's body has not
    /// been read yet.
    pub async fn send(&self, url: &str) -> Result<Response> {
        let mut current = url.to_string();

        for _ in 0..=MAX_REDIRECTS {
            let target = self.guard.authorize(&current).await?;
            let client = self.pinned_client(&target)?;

            tracing::debug!("GET {} via {:?}", target.url, target.addrs);
            let response = tokio::time::timeout(self.config.timeout, client.get(target.url.clone()).send())
                .await
                .map_err(|_| ServerError::UpstreamUnreachable(format!("timed out requesting {}", target.url)))?
                .map_err(|e| ServerError::UpstreamUnreachable(format!("request to {} failed: {}", target.url, e)))?;

            let status = response.status();
            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        ServerError::UpstreamUnreachable(format!(
                            "{} answered {} without a Location header",
                            target.url, status
                        ))
                    })?;
                let next = target.url.join(location).map_err(|e| {
                    ServerError::UpstreamUnreachable(format!("bad redirect {:?}: {}", location, e))
                })?;
                tracing::debug!("Redirect {} -> {}", target.url, next);
                current = next.to_string();
                continue;
            }

            if !status.is_success() {
                return Err(ServerError::UpstreamUnreachable(format!(
                    "{} answered {}",
                    target.url, status
                )));
            }

            return Ok(response);
        }

        Err(ServerError::UpstreamUnreachable(format!(
            "too many redirects starting at {}",
            url
        )))
    }

    /// GET and parse a JSON document
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.send(url).await?;
        let body = tokio::time::timeout(self.config.timeout, response.bytes())
            .await
            .map_err(|_| ServerError::UpstreamUnreachable(format!("timed out reading {}", url)))?
            .map_err(|e| ServerError::UpstreamUnreachable(format!("failed to read {}: {}", url, e)))?;

        serde_json::from_slice(&body)
            .map_err(|e| ServerError::ProtocolParse(format!("{}: {}", url, e)))
    }

    pub async fn fetch_index(&self, index_url: &str) -> Result<IndexDocument> {
        self.fetch_json(index_url).await
    }

    /// Streams of a remote index
    pub async fn list_streams(&self, index_url: &str) -> Result<Vec<UpstreamStream>> {
        let index = self.fetch_index(index_url).await?;
        Ok(index
            .index
            .into_iter()
            .map(|(stream_id, entry)| UpstreamStream {
                stream_id,
                path: entry.path,
                datatype: entry.datatype.unwrap_or_else(|| "image-ids".to_string()),
                format: entry.format.unwrap_or_else(|| "products:1.0".to_string()),
                products: entry.products,
                updated: entry.updated,
                origin_index_url: index_url.to_string(),
            })
            .collect())
    }

    async fn fetch_products(&self, index_url: &str, stream_id: &str, entry: &IndexEntry) -> Result<(String, ProductsDocument)> {
        let path = entry.path.clone().ok_or_else(|| {
            ServerError::ProtocolParse(format!("stream {} has no product path", stream_id))
        })?;
        let root = mirror_root(index_url)?;
        let products_url = root
            .join(path.trim_start_matches('/'))
            .map_err(|e| ServerError::ProtocolParse(format!("bad stream path {:?}: {}", path, e)))?;
        let doc = self.fetch_json(products_url.as_str()).await?;
        Ok((path, doc))
    }

    /// Products of one stream, newest first
    pub async fn list_products(&self, index_url: &str, stream_id: &str) -> Result<Vec<UpstreamProduct>> {
        let index = self.fetch_index(index_url).await?;
        let entry = index.index.get(stream_id).ok_or_else(|| {
            ServerError::ProductNotFound(format!("stream {} not in index", stream_id))
        })?;

        let (stream_path, doc) = self.fetch_products(index_url, stream_id, entry).await?;

        let mut products: Vec<UpstreamProduct> = doc
            .products
            .iter()
            .map(|(pid, product)| {
                UpstreamProduct::from_entry(pid, product, stream_id, &stream_path, index_url)
            })
            .collect();
        sort_products(&mut products);
        Ok(products)
    }

    /// Locate `product_id` in the index and resolve its latest version
    pub async fn resolve_product(&self, index_url: &str, product_id: &str) -> Result<ResolvedProduct> {
        let index = self.fetch_index(index_url).await?;
        let (stream_id, entry) = index
            .index
            .iter()
            .find(|(_, entry)| entry.products.iter().any(|p| p == product_id))
            .ok_or_else(|| {
                ServerError::ProductNotFound(format!("{} not present in upstream index", product_id))
            })?;

        let (stream_path, mut doc) = self.fetch_products(index_url, stream_id, entry).await?;
        let product = doc.products.remove(product_id).ok_or_else(|| {
            ServerError::ProductNotFound(format!(
                "{} missing from products document of {}",
                product_id, stream_id
            ))
        })?;

        let (version, version_entry) = product
            .latest_version()
            .map(|(key, v)| (key.clone(), v.clone()))
            .ok_or_else(|| {
                ServerError::ProtocolParse(format!("{} has no versions", product_id))
            })?;

        if version_entry.items.is_empty() {
            return Err(ServerError::ProtocolParse(format!(
                "{} version {} has no items",
                product_id, version
            )));
        }

        Ok(ResolvedProduct {
            stream_id: stream_id.clone(),
            stream_path,
            product_id: product_id.to_string(),
            items: version_entry.items.into_iter().collect(),
            version_meta: version_entry.meta,
            entry: product,
            version,
            mirror_root: mirror_root(index_url)?,
        })
    }
}

/// Base URL of a mirror: the index URL path up to `/streams/`
pub fn mirror_root(index_url: &str) -> Result<Url> {
    let mut url = Url::parse(index_url)
        .map_err(|e| ServerError::UpstreamBlocked(format!("invalid URL {:?}: {}", index_url, e)))?;

    let path = url.path().to_string();
    let prefix = match path.find("/streams/") {
        Some(pos) => &path[..pos],
        // No streams segment: use the index document's directory
        None => path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(""),
    };
    let mut root = prefix.to_string();
    if !root.ends_with('/') {
        root.push('/');
    }

    url.set_path(&root);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Latest version key descending, then product id descending
pub fn sort_products(products: &mut [UpstreamProduct]) {
    products.sort_by(|a, b| {
        let key_a = a.build_id.as_deref().unwrap_or("");
        let key_b = b.build_id.as_deref().unwrap_or("");
        key_b
            .cmp(key_a)
            .then_with(|| b.product_id.cmp(&a.product_id))
    });
}
