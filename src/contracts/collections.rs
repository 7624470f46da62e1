use ethers::prelude::abigen;

abigen!(
    ICollections,
    r#"[
        function totalCollections() external view returns (uint256)
        function getCollection(uint256 collectionId) external view returns (address owner, address treasury, uint256 royaltyBps, string name, address[] nfts)
    ]"#
);
