//! Simplestream document types.
//!
//! Only the keys the mirror relies on are typed; everything else in a
//! product entry is kept as raw JSON in `meta` so nothing is lost.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `streams/v1/index.json`
#[derive(Debug, Clone, Deserialize)]
pub struct IndexDocument {
    #[serde(default)]
    pub format: Option<String>,
    pub index: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexEntry {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub datatype: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

/// A stream's products document
#[derive(Debug, Clone, Deserialize)]
pub struct ProductsDocument {
    #[serde(default)]
    pub products: BTreeMap<String, ProductEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductEntry {
    #[serde(default)]
    pub versions: BTreeMap<String, VersionEntry>,
    #[serde(flatten)]
    pub meta: BTreeMap<String, Value>,
}

impl ProductEntry {
    /// String-valued metadata key, ignoring empty strings
    pub fn meta_str(&self, key: &str) -> Option<String> {
        match self.meta.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Latest version: the lexicographically greatest key
    pub fn latest_version(&self) -> Option<(&String, &VersionEntry)> {
        self.versions.iter().next_back()
    }

    /// "<release title> <arch> (<subarch>)"
    pub fn display_name(&self) -> String {
        let title = self
            .meta_str("release_title")
            .or_else(|| self.meta_str("release"))
            .unwrap_or_else(|| "Unknown release".to_string());
        let arch = self.meta_str("arch").unwrap_or_else(|| "unknown".to_string());
        match self.meta_str("subarch") {
            Some(subarch) => format!("{} {} ({})", title, arch, subarch),
            None => format!("{} {}", title, arch),
        }
    }

    /// Library name for an image mirrored from this product
    pub fn image_name(&self) -> String {
        let title = self
            .meta_str("release_title")
            .or_else(|| self.meta_str("label"))
            .unwrap_or_else(|| "Image".to_string());
        match self.meta_str("arch") {
            Some(arch) => format!("{} ({})", title, arch),
            None => title,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionEntry {
    #[serde(default)]
    pub items: BTreeMap<String, ItemEntry>,
    /// Everything else the version carries (label, pubname, support dates)
    #[serde(flatten)]
    pub meta: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemEntry {
    #[serde(default)]
    pub ftype: Option<String>,
    pub path: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default, deserialize_with = "lenient_size")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Some mirrors publish sizes as strings
fn lenient_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// One stream of a remote index, as returned by the API
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStream {
    pub stream_id: String,
    pub path: Option<String>,
    pub datatype: String,
    pub format: String,
    pub products: Vec<String>,
    pub updated: Option<String>,
    pub origin_index_url: String,
}

/// A candidate artifact of a remote product
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamArtifact {
    pub name: String,
    pub ftype: String,
    pub path: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// A remote product at its latest version, as returned by the API
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamProduct {
    pub product_id: String,
    pub name: String,
    pub stream_id: String,
    pub stream_path: String,
    pub stream_updated: Option<String>,
    pub origin_index_url: String,
    pub os: Option<String>,
    pub release: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub subarch: Option<String>,
    pub label: Option<String>,
    pub kflavor: Option<String>,
    pub krel: Option<String>,
    pub build_id: Option<String>,
    pub artifacts: Vec<UpstreamArtifact>,
}

impl UpstreamProduct {
    pub fn from_entry(
        product_id: &str,
        entry: &ProductEntry,
        stream_id: &str,
        stream_path: &str,
        index_url: &str,
    ) -> Self {
        let latest = entry.latest_version();
        let artifacts = latest
            .map(|(_, version)| {
                version
                    .items
                    .iter()
                    .map(|(name, item)| UpstreamArtifact {
                        name: name.clone(),
                        ftype: item.ftype.clone().unwrap_or_else(|| name.clone()),
                        path: item.path.clone(),
                        size: item.size,
                        sha256: item.sha256.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            product_id: product_id.to_string(),
            name: entry.display_name(),
            stream_id: stream_id.to_string(),
            stream_path: stream_path.to_string(),
            stream_updated: entry.meta_str("updated"),
            origin_index_url: index_url.to_string(),
            os: entry.meta_str("os"),
            release: entry.meta_str("release"),
            version: entry.meta_str("version"),
            arch: entry.meta_str("arch"),
            subarch: entry.meta_str("subarch"),
            label: entry.meta_str("label"),
            kflavor: entry.meta_str("kflavor"),
            krel: entry.meta_str("krel"),
            build_id: latest.map(|(key, _)| key.clone()),
            artifacts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCTS: &str = r#"{
        "content_id": "com.ubuntu.maas:stable:v3:download",
        "products": {
            "com.ubuntu.maas.stable:v3:boot:24.04:amd64:ga-24.04": {
                "arch": "amd64",
                "os": "ubuntu",
                "release": "noble",
                "release_title": "24.04 LTS",
                "subarch": "ga-24.04",
                "support_eol": "2029-05-31",
                "version": "24.04",
                "versions": {
                    "20240101": {"items": {}},
                    "20240301": {
                        "label": "stable",
                        "items": {
                            "boot-kernel": {"ftype": "boot-kernel", "path": "noble/boot-kernel", "sha256": "ab", "size": 10, "md5": "cd"},
                            "boot-initrd": {"ftype": "boot-initrd", "path": "noble/boot-initrd", "size": "20"}
                        }
                    }
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_products_document() {
        let doc: ProductsDocument = serde_json::from_str(PRODUCTS).unwrap();
        let entry = doc
            .products
            .get("com.ubuntu.maas.stable:v3:boot:24.04:amd64:ga-24.04")
            .unwrap();

        let (key, version) = entry.latest_version().unwrap();
        assert_eq!(key, "20240301");
        assert_eq!(version.items["boot-initrd"].size, Some(20));
        assert_eq!(version.items["boot-initrd"].sha256, None);
        assert_eq!(entry.display_name(), "24.04 LTS amd64 (ga-24.04)");
        assert_eq!(entry.image_name(), "24.04 LTS (amd64)");
        assert_eq!(entry.meta_str("os").as_deref(), Some("ubuntu"));
        assert!(!entry.meta.contains_key("versions"));
        assert_eq!(entry.meta["support_eol"], "2029-05-31");
        assert_eq!(version.meta["label"], "stable");
        assert!(!version.meta.contains_key("items"));
        let kernel = &version.items["boot-kernel"];
        assert_eq!(kernel.extra["md5"], "cd");
        assert!(!kernel.extra.contains_key("sha256"));
    }

    #[test]
    fn test_index_requires_index_key() {
        assert!(serde_json::from_str::<IndexDocument>(r#"{"format":"index:1.0"}"#).is_err());
        let doc: IndexDocument =
            serde_json::from_str(r#"{"index":{"s1":{"path":"streams/v1/s1.json"}}}"#).unwrap();
        assert!(doc.index["s1"].products.is_empty());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let entry: ProductEntry = serde_json::from_str(r#"{"label": "daily"}"#).unwrap();
        assert_eq!(entry.display_name(), "Unknown release unknown");
        assert_eq!(entry.image_name(), "daily");
        assert!(entry.latest_version().is_none());
    }
}
