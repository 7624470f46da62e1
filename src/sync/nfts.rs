//! NFT contract and token resolution.
//!
//! The contract record itself (name, symbol, URI) is cache-aside like every other
//! entity. Metadata and images are judged separately: they are re-resolved when the
//! cached image does not yet point into the managed asset namespace.

use super::{ChainSync, SyncEnv};
use crate::assets::metadata_image;
use crate::models::{ImageRefs, NftRecord, NftTokenEntry};
use ethers::types::{Address, U256};
use log::debug;

impl ChainSync {
    pub(crate) async fn retrieve_nft(&self, env: &SyncEnv, address: Address, force: bool) -> Option<NftRecord> {
        let record = self
            .retrieve_cached(
                env,
                "nft",
                &address,
                force,
                |ds| Some(&ds.nfts),
                |ds| Some(&mut ds.nfts),
                || self.client.nft_details(address),
            )
            .await?;

        if force || !self.has_managed_images(env, record.images.as_ref()) {
            if let Some(uri) = &record.uri {
                self.resolve_nft_assets(env, address, uri, force).await;
                return self.dataset.read().await.nft(address).cloned();
            }
        }
        Some(record)
    }

    fn has_managed_images(&self, env: &SyncEnv, images: Option<&ImageRefs>) -> bool {
        images.map_or(false, |i| env.services.assets.is_managed(&i.high_res))
    }

    async fn resolve_nft_assets(&self, env: &SyncEnv, address: Address, uri: &str, force: bool) {
        let Some(metadata) = self.fetch_metadata(env, uri).await else {
            return;
        };
        let images = self.cache_image(env, address, &metadata, None, force).await;

        let mut ds = self.dataset.write().await;
        if let Some(nft) = ds.nft_mut(address) {
            nft.metadata = Some(metadata);
            if images.is_some() {
                nft.images = images;
            }
        }
    }

    /// Per-token metadata and images. The owning contract is resolved first.
    pub(crate) async fn retrieve_nft_token(
        &self,
        env: &SyncEnv,
        address: Address,
        token_id: U256,
        force: bool,
    ) -> Option<NftTokenEntry> {
        let nft = self.retrieve_nft(env, address, false).await?;
        let cached = nft.token(token_id).cloned();
        if let Some(entry) = &cached {
            if !force && self.has_managed_images(env, entry.images.as_ref()) {
                return cached;
            }
        }

        env.services.metrics.record_fetch("nft_token");
        let uri = match self.client.token_uri(address, token_id).await {
            Ok(Some(uri)) => uri,
            Ok(None) => {
                env.services.metrics.record_not_found("nft_token");
                return cached;
            }
            Err(e) => {
                self.note_source_error(env, "nft_token", &(address, token_id), &e);
                return cached;
            }
        };
        let metadata = self.fetch_metadata(env, &uri).await;
        let images = match &metadata {
            Some(m) => self.cache_image(env, address, m, Some(token_id), force).await,
            None => None,
        };

        let mut ds = self.dataset.write().await;
        let nft = ds.nft_mut(address)?;
        match nft.tokens.iter_mut().find(|t| t.token_id == token_id) {
            Some(entry) => {
                entry.uri = uri;
                if metadata.is_some() {
                    entry.metadata = metadata;
                }
                if images.is_some() {
                    entry.images = images;
                }
                Some(entry.clone())
            }
            None => {
                debug!("[{}] cached token {} of {:?}", self.config.name, token_id, address);
                let entry = NftTokenEntry { token_id, uri, metadata, images };
                nft.tokens.push(entry.clone());
                Some(entry)
            }
        }
    }

    async fn fetch_metadata(&self, env: &SyncEnv, uri: &str) -> Option<serde_json::Value> {
        env.services.metrics.record_fetch("metadata");
        match env.services.assets.fetch_metadata(uri).await {
            Ok(Some(metadata)) => Some(metadata),
            Ok(None) => {
                env.services.metrics.record_not_found("metadata");
                None
            }
            Err(e) => {
                self.note_source_error(env, "metadata", &uri, &e);
                None
            }
        }
    }

    async fn cache_image(
        &self,
        env: &SyncEnv,
        address: Address,
        metadata: &serde_json::Value,
        token_id: Option<U256>,
        force: bool,
    ) -> Option<ImageRefs> {
        let source = metadata_image(metadata)?;
        match env
            .services
            .assets
            .cache_image(&self.config.name, address, &source, token_id, force)
            .await
        {
            Ok(images) => images,
            Err(e) => {
                self.note_source_error(env, "image", &source, &e);
                None
            }
        }
    }
}
