// Contracts Module - Read-only marketplace ABIs

pub mod collections;
pub mod erc721;
pub mod marketplace;
pub mod releases;

pub use collections::ICollections;
pub use erc721::IErc721Metadata;
pub use marketplace::{DirectBuyFilter, IMarketplace, ListingCancelledFilter, OfferAcceptedFilter};
pub use releases::{IReleases, ReleasePurchasedFilter};
