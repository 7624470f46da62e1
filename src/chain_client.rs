//! # Chain Client
//!
//! Read-only access to one chain's marketplace, collection and release contracts.
//!
//! Every call fails soft: `Ok(None)` means the contract has no such entity (the call
//! reverted), `Err(SourceError)` means the node could not answer this time. Callers
//! keep their cached value on `Err`.

use crate::contracts::{
    DirectBuyFilter, ICollections, IErc721Metadata, IMarketplace, IReleases,
    ListingCancelledFilter, OfferAcceptedFilter, ReleasePurchasedFilter,
};
use crate::error::SourceError;
use crate::models::{CollectionRecord, ListingRecord, NftRecord, OfferRecord, ReleaseRecord};
use crate::settings::ChainConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use ethers::contract::ContractError;
use ethers::prelude::{Address, Http, Middleware, Provider, H256, U256};
use log::debug;
use std::sync::Arc;

/// `Ok(None)` = not found, `Err` = transient failure.
pub type SourceResult<T> = std::result::Result<Option<T>, SourceError>;

/// Marketplace log that defines a sale or its absence.
#[derive(Debug, Clone, PartialEq)]
pub enum SaleEventKind {
    DirectBuy {
        version: u32,
        listing_id: u64,
        buyer: Address,
        amount: U256,
        payment_token: Address,
    },
    OfferAccepted {
        version: u32,
        listing_id: u64,
        offeror: Address,
        amount: U256,
        payment_token: Address,
    },
    ListingCancelled {
        version: u32,
        listing_id: u64,
    },
    ReleasePurchased {
        release_id: u64,
        buyer: Address,
        quantity: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaleEvent {
    pub block_number: u64,
    pub tx_hash: H256,
    pub kind: SaleEventKind,
}

impl SaleEvent {
    /// (version, listing id) this event closes, if it is a listing event.
    pub fn listing(&self) -> Option<(u32, u64)> {
        match &self.kind {
            SaleEventKind::DirectBuy { version, listing_id, .. }
            | SaleEventKind::OfferAccepted { version, listing_id, .. }
            | SaleEventKind::ListingCancelled { version, listing_id } => Some((*version, *listing_id)),
            SaleEventKind::ReleasePurchased { .. } => None,
        }
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn total_listings(&self, version: u32) -> SourceResult<u64>;

    async fn listing(&self, version: u32, id: u64) -> SourceResult<ListingRecord>;

    async fn total_offers(&self, version: u32, listing_id: u64, token: Address) -> SourceResult<u64>;

    async fn offer(
        &self,
        version: u32,
        listing_id: u64,
        token: Address,
        offer_id: u64,
    ) -> SourceResult<OfferRecord>;

    async fn total_collections(&self) -> SourceResult<u64>;

    async fn collection(&self, id: u64) -> SourceResult<CollectionRecord>;

    async fn total_releases(&self) -> SourceResult<u64>;

    async fn release(&self, id: u64) -> SourceResult<ReleaseRecord>;

    async fn nft_details(&self, address: Address) -> SourceResult<NftRecord>;

    async fn token_uri(&self, address: Address, token_id: U256) -> SourceResult<String>;

    async fn block_number(&self) -> std::result::Result<u64, SourceError>;

    /// Sale-defining logs in `[from_block, to_block]`, both inclusive.
    async fn sale_events(&self, from_block: u64, to_block: u64) -> std::result::Result<Vec<SaleEvent>, SourceError>;

    /// Unix timestamp of `block`.
    async fn block_timestamp(&self, block: u64) -> SourceResult<u64>;
}

pub(crate) fn saturating_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

/// Reverts mean "no such entity"; anything else is transient.
fn soft<M: Middleware, T>(result: std::result::Result<T, ContractError<M>>) -> SourceResult<T> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_revert() => Ok(None),
        Err(e) => Err(SourceError::from_message(e.to_string())),
    }
}

fn transient<M: Middleware>(e: ContractError<M>) -> SourceError {
    SourceError::from_message(e.to_string())
}

/// [`ChainClient`] over JSON-RPC with ethers-rs contract bindings.
pub struct EthersChainClient<M: Middleware> {
    chain: String,
    provider: Arc<M>,
    marketplaces: Vec<(u32, IMarketplace<M>)>,
    collections: ICollections<M>,
    releases: IReleases<M>,
}

impl EthersChainClient<Provider<Http>> {
    /// Build an HTTP client whose requests time out after `config.rpc_timeout()`.
    pub fn connect(config: &ChainConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.rpc_timeout()).build()?;
        let url = url::Url::parse(&config.rpc_url)?;
        let provider = Provider::new(Http::new_with_client(url, http));
        Ok(Self::new(config, Arc::new(provider)))
    }
}

impl<M: Middleware + 'static> EthersChainClient<M> {
    pub fn new(config: &ChainConfig, provider: Arc<M>) -> Self {
        let marketplaces = config
            .marketplaces()
            .into_iter()
            .map(|(version, address)| (version, IMarketplace::new(address, provider.clone())))
            .collect();
        Self {
            chain: config.name.clone(),
            collections: ICollections::new(config.collections, provider.clone()),
            releases: IReleases::new(config.releases, provider.clone()),
            marketplaces,
            provider,
        }
    }

    fn marketplace(&self, version: u32) -> Option<&IMarketplace<M>> {
        self.marketplaces.iter().find(|(v, _)| *v == version).map(|(_, c)| c)
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for EthersChainClient<M> {
    async fn total_listings(&self, version: u32) -> SourceResult<u64> {
        let Some(market) = self.marketplace(version) else {
            return Ok(None);
        };
        Ok(soft(market.total_listings().call().await)?.map(saturating_u64))
    }

    async fn listing(&self, version: u32, id: u64) -> SourceResult<ListingRecord> {
        let Some(market) = self.marketplace(version) else {
            return Ok(None);
        };
        let raw = soft(market.get_listing(U256::from(id)).call().await)?;
        Ok(raw.and_then(
            |(owner, payment_token, nft_address, token_id, min_price, max_price, start, end, created, closed, state)| {
                // unassigned slots come back zeroed instead of reverting
                if owner.is_zero() {
                    return None;
                }
                Some(ListingRecord {
                    version,
                    id,
                    owner,
                    payment_token,
                    nft_address,
                    token_id,
                    min_price,
                    max_price,
                    start_time: saturating_u64(start),
                    end_time: saturating_u64(end),
                    created_block: saturating_u64(created),
                    closed_block: saturating_u64(closed),
                    sale_state: state,
                    finalized: false,
                    was_sold: false,
                    top_offer: None,
                    tx_hash: None,
                    sale: None,
                    collection_id: None,
                    collection_name: None,
                    last_retrieved: Utc::now(),
                    offers: Vec::new(),
                })
            },
        ))
    }

    async fn total_offers(&self, version: u32, listing_id: u64, token: Address) -> SourceResult<u64> {
        let Some(market) = self.marketplace(version) else {
            return Ok(None);
        };
        Ok(soft(market.total_offers(U256::from(listing_id), token).call().await)?.map(saturating_u64))
    }

    async fn offer(
        &self,
        version: u32,
        listing_id: u64,
        token: Address,
        offer_id: u64,
    ) -> SourceResult<OfferRecord> {
        let Some(market) = self.marketplace(version) else {
            return Ok(None);
        };
        let raw = soft(
            market
                .get_offer(U256::from(listing_id), token, U256::from(offer_id))
                .call()
                .await,
        )?;
        Ok(raw.and_then(|(offeror, amount, discount, claimed, created, end)| {
            if offeror.is_zero() {
                return None;
            }
            Some(OfferRecord {
                payment_token: token,
                offer_id,
                offeror,
                amount,
                discount,
                claimed,
                created_block: saturating_u64(created),
                end_block: saturating_u64(end),
                last_retrieved: Utc::now(),
            })
        }))
    }

    async fn total_collections(&self) -> SourceResult<u64> {
        Ok(soft(self.collections.total_collections().call().await)?.map(saturating_u64))
    }

    async fn collection(&self, id: u64) -> SourceResult<CollectionRecord> {
        let raw = soft(self.collections.get_collection(U256::from(id)).call().await)?;
        Ok(raw.and_then(|(owner, treasury, royalty, name, nfts)| {
            if owner.is_zero() {
                return None;
            }
            Some(CollectionRecord {
                id,
                owner,
                treasury,
                royalty_bps: saturating_u64(royalty).min(u32::MAX as u64) as u32,
                name,
                nft_addresses: nfts,
                last_retrieved: Utc::now(),
            })
        }))
    }

    async fn total_releases(&self) -> SourceResult<u64> {
        Ok(soft(self.releases.total_releases().call().await)?.map(saturating_u64))
    }

    async fn release(&self, id: u64) -> SourceResult<ReleaseRecord> {
        let raw = soft(self.releases.get_release(U256::from(id)).call().await)?;
        Ok(raw.and_then(
            |(owner, nft_address, treasury, payment_token, price, sold, max_supply, end_date, whitelist_only, ended)| {
                if owner.is_zero() {
                    return None;
                }
                Some(ReleaseRecord {
                    id,
                    owner,
                    nft_address,
                    treasury,
                    payment_token,
                    price,
                    sold: saturating_u64(sold),
                    max_supply: saturating_u64(max_supply),
                    end_date: saturating_u64(end_date),
                    whitelist_only,
                    ended,
                    last_retrieved: Utc::now(),
                })
            },
        ))
    }

    async fn nft_details(&self, address: Address) -> SourceResult<NftRecord> {
        let token = IErc721Metadata::new(address, self.provider.clone());
        let Some(name) = soft(token.name().call().await)? else {
            return Ok(None);
        };
        let symbol = soft(token.symbol().call().await)?.unwrap_or_default();
        // contractURI is optional in ERC-721
        let uri = soft(token.contract_uri().call().await).ok().flatten().filter(|u| !u.is_empty());
        Ok(Some(NftRecord {
            address,
            name,
            symbol,
            uri,
            metadata: None,
            images: None,
            tokens: Vec::new(),
            last_retrieved: Utc::now(),
        }))
    }

    async fn token_uri(&self, address: Address, token_id: U256) -> SourceResult<String> {
        let token = IErc721Metadata::new(address, self.provider.clone());
        Ok(soft(token.token_uri(token_id).call().await)?.filter(|u| !u.is_empty()))
    }

    async fn block_number(&self) -> std::result::Result<u64, SourceError> {
        self.provider
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(|e| SourceError::from_message(e.to_string()))
    }

    async fn sale_events(&self, from_block: u64, to_block: u64) -> std::result::Result<Vec<SaleEvent>, SourceError> {
        let mut events = Vec::new();

        for (version, market) in &self.marketplaces {
            let version = *version;
            let buys = market
                .event::<DirectBuyFilter>()
                .from_block(from_block)
                .to_block(to_block)
                .query_with_meta()
                .await
                .map_err(transient)?;
            events.extend(buys.into_iter().map(|(e, meta)| SaleEvent {
                block_number: meta.block_number.as_u64(),
                tx_hash: meta.transaction_hash,
                kind: SaleEventKind::DirectBuy {
                    version,
                    listing_id: saturating_u64(e.listing_id),
                    buyer: e.buyer,
                    amount: e.amount,
                    payment_token: e.payment_token,
                },
            }));

            let accepted = market
                .event::<OfferAcceptedFilter>()
                .from_block(from_block)
                .to_block(to_block)
                .query_with_meta()
                .await
                .map_err(transient)?;
            events.extend(accepted.into_iter().map(|(e, meta)| SaleEvent {
                block_number: meta.block_number.as_u64(),
                tx_hash: meta.transaction_hash,
                kind: SaleEventKind::OfferAccepted {
                    version,
                    listing_id: saturating_u64(e.listing_id),
                    offeror: e.offeror,
                    amount: e.amount,
                    payment_token: e.payment_token,
                },
            }));

            let cancelled = market
                .event::<ListingCancelledFilter>()
                .from_block(from_block)
                .to_block(to_block)
                .query_with_meta()
                .await
                .map_err(transient)?;
            events.extend(cancelled.into_iter().map(|(e, meta)| SaleEvent {
                block_number: meta.block_number.as_u64(),
                tx_hash: meta.transaction_hash,
                kind: SaleEventKind::ListingCancelled {
                    version,
                    listing_id: saturating_u64(e.listing_id),
                },
            }));
        }

        let purchases = self
            .releases
            .event::<ReleasePurchasedFilter>()
            .from_block(from_block)
            .to_block(to_block)
            .query_with_meta()
            .await
            .map_err(transient)?;
        events.extend(purchases.into_iter().map(|(e, meta)| SaleEvent {
            block_number: meta.block_number.as_u64(),
            tx_hash: meta.transaction_hash,
            kind: SaleEventKind::ReleasePurchased {
                release_id: saturating_u64(e.release_id),
                buyer: e.buyer,
                quantity: saturating_u64(e.quantity),
            },
        }));

        events.sort_by_key(|e| e.block_number);
        debug!(
            "[{}] {} sale events in blocks {}..={}",
            self.chain,
            events.len(),
            from_block,
            to_block
        );
        Ok(events)
    }

    async fn block_timestamp(&self, block: u64) -> SourceResult<u64> {
        match self.provider.get_block(block).await {
            Ok(b) => Ok(b.map(|b| saturating_u64(b.timestamp))),
            Err(e) => Err(SourceError::from_message(e.to_string())),
        }
    }
}
