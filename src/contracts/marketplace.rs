use ethers::prelude::abigen;

abigen!(
    IMarketplace,
    r#"[
        function totalListings() external view returns (uint256)
        function getListing(uint256 listingId) external view returns (address owner, address paymentToken, address nftAddress, uint256 tokenId, uint256 minPrice, uint256 maxPrice, uint256 startTime, uint256 endTime, uint256 createdBlock, uint256 closedBlock, uint8 saleState)
        function totalOffers(uint256 listingId, address paymentToken) external view returns (uint256)
        function getOffer(uint256 listingId, address paymentToken, uint256 offerId) external view returns (address offeror, uint256 amount, uint256 discount, bool claimed, uint256 createdBlock, uint256 endBlock)
        event DirectBuy(uint256 indexed listingId, address indexed buyer, uint256 amount, address paymentToken)
        event OfferAccepted(uint256 indexed listingId, address indexed offeror, uint256 amount, address paymentToken)
        event ListingCancelled(uint256 indexed listingId)
    ]"#
);
