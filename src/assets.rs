//! # Asset Cache
//!
//! NFT metadata resolution and image caching, plus the pinning client used by the
//! IPFS pin stage.
//!
//! An image reference is *managed* when it already points into the cache namespace
//! (`assets.public_base_url`). Anything else is a raw remote URI that still has to
//! be cached.

use crate::error::SourceError;
use crate::models::ImageRefs;
use crate::settings::AssetSettings;
use async_trait::async_trait;
use ethers::types::{Address, U256};
use log::{debug, info};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

#[async_trait]
pub trait AssetCache: Send + Sync {
    /// Resolve a token/contract metadata URI to its JSON document.
    async fn fetch_metadata(&self, uri: &str) -> Result<Option<serde_json::Value>, SourceError>;

    /// Cache the image at `source_uri`. Idempotent unless `force` is set.
    async fn cache_image(
        &self,
        chain: &str,
        entity: Address,
        source_uri: &str,
        token_id: Option<U256>,
        force: bool,
    ) -> Result<Option<ImageRefs>, SourceError>;

    fn is_managed(&self, reference: &str) -> bool;
}

#[async_trait]
pub trait Pinner: Send + Sync {
    /// Submit content identifiers for pinning. Returns how many were accepted.
    async fn pin(&self, cids: &[String]) -> Result<usize, SourceError>;
}

/// Content identifier referenced by `reference`, if it is an IPFS reference.
///
/// Accepts `ipfs://<cid>[/path]`, `/ipfs/<cid>` gateway paths and bare CIDs.
pub fn ipfs_cid(reference: &str) -> Option<String> {
    let trimmed = reference.trim();
    let rest = if let Some(rest) = trimmed.strip_prefix("ipfs://") {
        rest.trim_start_matches("ipfs/")
    } else if let Some(idx) = trimmed.find("/ipfs/") {
        &trimmed[idx + "/ipfs/".len()..]
    } else {
        trimmed
    };
    let cid = rest.split(&['/', '?', '#'][..]).next().unwrap_or_default();
    let looks_like_cid = (cid.starts_with("Qm") && cid.len() == 46)
        || (cid.starts_with("bafy") && cid.len() > 50);
    if looks_like_cid && cid.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(cid.to_string())
    } else {
        None
    }
}

/// HTTP(S) URL for `uri`, routing IPFS references through `gateway`.
pub fn gateway_url(uri: &str, gateway: &str) -> String {
    let uri = uri.trim();
    if let Some(rest) = uri.strip_prefix("ipfs://") {
        let rest = rest.trim_start_matches("ipfs/");
        format!("{}/{}", gateway.trim_end_matches('/'), rest)
    } else if !uri.contains("://") && ipfs_cid(uri).is_some() {
        format!("{}/{}", gateway.trim_end_matches('/'), uri)
    } else {
        uri.to_string()
    }
}

/// Image URL advertised by a metadata document.
pub fn metadata_image(metadata: &serde_json::Value) -> Option<String> {
    ["image", "image_url", "imageUrl"]
        .iter()
        .find_map(|k| metadata.get(*k).and_then(|v| v.as_str()))
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Downloads images into `cache_dir` and serves them under `public_base_url`.
pub struct DiskAssetCache {
    cache_dir: PathBuf,
    public_base_url: String,
    ipfs_gateway: String,
    client: reqwest::Client,
}

impl DiskAssetCache {
    pub fn new(settings: &AssetSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        let mut public_base_url = settings.public_base_url.clone();
        if !public_base_url.ends_with('/') {
            public_base_url.push('/');
        }
        Ok(Self {
            cache_dir: settings.cache_dir.clone(),
            public_base_url,
            ipfs_gateway: settings.ipfs_gateway.clone(),
            client,
        })
    }

    fn relative_path(chain: &str, entity: Address, token_id: Option<U256>) -> String {
        let name = token_id.map(|t| t.to_string()).unwrap_or_else(|| "contract".to_string());
        format!("{}/{:?}/{}", chain, entity, name)
    }

    fn refs(&self, relative: &str) -> ImageRefs {
        let high_res = format!("{}{}", self.public_base_url, relative);
        // thumbnails are derived by the asset server from the original
        let low_res = format!("{}?size=thumb", high_res);
        ImageRefs { high_res, low_res }
    }

    async fn download(&self, uri: &str) -> Result<Option<Vec<u8>>, SourceError> {
        let url = gateway_url(uri, &self.ipfs_gateway);
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(None);
        }
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if status.as_u16() == 429 {
            return Err(SourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(SourceError::Transport(format!("HTTP error {} for {}", status, url)));
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }
}

#[async_trait]
impl AssetCache for DiskAssetCache {
    async fn fetch_metadata(&self, uri: &str) -> Result<Option<serde_json::Value>, SourceError> {
        if let Some(inline) = uri.strip_prefix("data:application/json,") {
            return serde_json::from_str(inline)
                .map(Some)
                .map_err(|e| SourceError::Malformed(e.to_string()));
        }
        let Some(bytes) = self.download(uri).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SourceError::Malformed(format!("metadata at {}: {}", uri, e)))
    }

    async fn cache_image(
        &self,
        chain: &str,
        entity: Address,
        source_uri: &str,
        token_id: Option<U256>,
        force: bool,
    ) -> Result<Option<ImageRefs>, SourceError> {
        let relative = Self::relative_path(chain, entity, token_id);
        let path = self.cache_dir.join(&relative);
        if !force && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Some(self.refs(&relative)));
        }
        let Some(bytes) = self.download(source_uri).await? else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SourceError::Transport(e.to_string()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        debug!("cached {} bytes from {} at {}", bytes.len(), source_uri, path.display());
        Ok(Some(self.refs(&relative)))
    }

    fn is_managed(&self, reference: &str) -> bool {
        reference.starts_with(&self.public_base_url)
    }
}

/// Pinning service client (`POST {endpoint}` with `{"cids": [...]}`).
pub struct HttpPinner {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpPinner {
    pub fn from_settings(settings: &AssetSettings) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = settings.pin_endpoint.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Some(Self { endpoint, api_key: settings.pin_api_key.clone(), client }))
    }
}

#[async_trait]
impl Pinner for HttpPinner {
    async fn pin(&self, cids: &[String]) -> Result<usize, SourceError> {
        if cids.is_empty() {
            return Ok(0);
        }
        let mut request = self.client.post(&self.endpoint).json(&json!({ "cids": cids }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(SourceError::Transport(format!("pin service returned {}", status)));
        }
        info!("submitted {} CIDs for pinning", cids.len());
        Ok(cids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

    #[test]
    fn test_ipfs_cid_forms() {
        assert_eq!(ipfs_cid(&format!("ipfs://{}/1.png", CID)).as_deref(), Some(CID));
        assert_eq!(ipfs_cid(&format!("ipfs://ipfs/{}", CID)).as_deref(), Some(CID));
        assert_eq!(ipfs_cid(&format!("https://gw.example/ipfs/{}?x=1", CID)).as_deref(), Some(CID));
        assert_eq!(ipfs_cid(CID).as_deref(), Some(CID));
        assert_eq!(ipfs_cid("https://example.com/image.png"), None);
    }

    #[test]
    fn test_gateway_url() {
        let gw = "https://ipfs.io/ipfs/";
        assert_eq!(
            gateway_url(&format!("ipfs://{}/meta.json", CID), gw),
            format!("https://ipfs.io/ipfs/{}/meta.json", CID)
        );
        assert_eq!(gateway_url(CID, gw), format!("https://ipfs.io/ipfs/{}", CID));
        assert_eq!(gateway_url("https://a.b/c.json", gw), "https://a.b/c.json");
    }

    #[test]
    fn test_metadata_image() {
        let doc = json!({ "name": "x", "image_url": "https://a/b.png" });
        assert_eq!(metadata_image(&doc).as_deref(), Some("https://a/b.png"));
        assert_eq!(metadata_image(&json!({ "image": "" })), None);
    }

    #[tokio::test]
    async fn test_inline_metadata_and_managed_refs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AssetSettings {
            cache_dir: dir.path().to_path_buf(),
            public_base_url: "https://cdn.test/cache".to_string(),
            ..AssetSettings::default()
        };
        let cache = DiskAssetCache::new(&settings).unwrap();
        let doc = cache
            .fetch_metadata(r#"data:application/json,{"image":"ipfs://x"}"#)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["image"], "ipfs://x");

        let refs = cache.refs("polygon/0x00/1");
        assert!(cache.is_managed(&refs.high_res));
        assert!(cache.is_managed(&refs.low_res));
        assert!(!cache.is_managed("https://elsewhere/1.png"));
    }
}
