use ethers::prelude::abigen;

abigen!(
    IErc721Metadata,
    r#"[
        function name() external view returns (string)
        function symbol() external view returns (string)
        function contractURI() external view returns (string)
        function tokenURI(uint256 tokenId) external view returns (string)
    ]"#
);
