use ethers::prelude::abigen;

abigen!(
    IReleases,
    r#"[
        function totalReleases() external view returns (uint256)
        function getRelease(uint256 releaseId) external view returns (address owner, address nftAddress, address treasury, address paymentToken, uint256 price, uint256 sold, uint256 maxSupply, uint256 endDate, bool whitelistOnly, bool ended)
        event ReleasePurchased(uint256 indexed releaseId, address indexed buyer, uint256 quantity)
    ]"#
);
