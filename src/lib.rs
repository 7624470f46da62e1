//! # Market Sync
//!
//! Synchronization and cache engine for multi-chain NFT marketplace state. It keeps a
//! continuously refreshed snapshot of listings, offers, collections, token releases and
//! NFT metadata for every configured chain, plus USD prices for the payment tokens.
//!
//! ## Overview
//!
//! - **Cache-aside accessors**: every entity is served from cache while fresh and
//!   re-fetched from the chain once its TTL has passed. A failed re-fetch keeps the
//!   last good value.
//! - **Sync pipeline**: a fixed nine-stage pass per chain, all chains concurrently,
//!   bounded by a pass deadline with cooperative cancellation.
//! - **Finalization**: closed listings are matched to the event that closed them and
//!   get a sale record with its USD value.
//! - **Release-sale scan**: an incremental, resumable block scan for release purchases.
//!
//! ## Architecture
//!
//! ### Collaborators
//! [`chain_client::ChainClient`], [`price_oracle::PriceOracle`], [`assets::AssetCache`]
//! and [`assets::Pinner`] are traits with production implementations over JSON-RPC,
//! CoinGecko and HTTP. All of them fail soft.
//!
//! ### Engine
//! [`sync::SyncEngine`] owns one dataset per chain, runs passes and answers read-layer
//! queries. [`sync::Scheduler`] drives it on an interval.
//!
//! ### Persistence
//! The full dataset list is saved as one JSON snapshot after every pass.

// Core Types
/// Cached entities and the per-chain dataset
pub mod models;
/// Error taxonomy
pub mod error;
/// Generic cache-aside retrieval
pub mod cache_aside;

// Collaborators
/// Chain access trait and ethers-rs implementation
pub mod chain_client;
/// Smart contract ABIs (read-only)
pub mod contracts;
/// USD prices and the shared price cache
pub mod price_oracle;
/// Metadata, image caching and IPFS pinning
pub mod assets;

// Engine
/// Sync pipeline, engine and scheduler
pub mod sync;
/// Snapshot persistence
pub mod persistence;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use chain_client::{ChainClient, EthersChainClient};
pub use error::{SourceError, SyncError};
pub use settings::Settings;
pub use sync::{Scheduler, SyncEngine, SyncServices};
