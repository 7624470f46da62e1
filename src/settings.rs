use config::{Config, ConfigError, File, FileFormat};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn default_cache_ttl_minutes() -> u64 {
    5
}
fn default_interval_seconds() -> u64 {
    60
}
fn default_throttle_delay_ms() -> u64 {
    250
}
fn default_max_pass_seconds_bootstrap() -> u64 {
    3600 // first full sync walks every listing ever created
}
fn default_max_pass_seconds() -> u64 {
    240
}
fn default_max_blocks_per_pass() -> u64 {
    50_000
}
fn default_scan_window_blocks() -> u64 {
    5000
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/snapshot.json")
}
fn default_metrics_reset_seconds() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    #[serde(default = "default_cache_ttl_minutes")]
    pub cache_ttl_minutes: u64,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Minimum delay between consecutive rate-limited calls (historical logs, historical prices).
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,
    #[serde(default = "default_max_pass_seconds_bootstrap")]
    pub max_pass_seconds_bootstrap: u64,
    #[serde(default = "default_max_pass_seconds")]
    pub max_pass_seconds: u64,
    #[serde(default = "default_max_blocks_per_pass")]
    pub max_blocks_per_pass: u64,
    #[serde(default = "default_scan_window_blocks")]
    pub scan_window_blocks: u64,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_metrics_reset_seconds")]
    pub metrics_reset_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache_ttl_minutes: default_cache_ttl_minutes(),
            interval_seconds: default_interval_seconds(),
            throttle_delay_ms: default_throttle_delay_ms(),
            max_pass_seconds_bootstrap: default_max_pass_seconds_bootstrap(),
            max_pass_seconds: default_max_pass_seconds(),
            max_blocks_per_pass: default_max_blocks_per_pass(),
            scan_window_blocks: default_scan_window_blocks(),
            snapshot_path: default_snapshot_path(),
            metrics_reset_seconds: default_metrics_reset_seconds(),
        }
    }
}

impl SyncSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_minutes * 60)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    /// Pass budget: longer until the bootstrap sync has completed once.
    pub fn max_pass_duration(&self, bootstrapped: bool) -> Duration {
        if bootstrapped {
            Duration::from_secs(self.max_pass_seconds)
        } else {
            Duration::from_secs(self.max_pass_seconds_bootstrap)
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PaymentToken {
    pub address: Address,
    /// Token identifier understood by the price oracle (e.g. a CoinGecko id).
    pub price_key: String,
    #[serde(default = "default_token_decimals")]
    pub decimals: u8,
}

fn default_token_decimals() -> u8 {
    18
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default)]
    pub marketplace_v1: Option<Address>,
    #[serde(default)]
    pub marketplace_v2: Option<Address>,
    pub collections: Address,
    pub releases: Address,
    /// First block that may contain release sales.
    pub start_block: u64,
    #[serde(default)]
    pub payment_tokens: Vec<PaymentToken>,
}

impl ChainConfig {
    /// Configured marketplace contracts as (version, address).
    pub fn marketplaces(&self) -> Vec<(u32, Address)> {
        let mut out = Vec::new();
        if let Some(addr) = self.marketplace_v1 {
            out.push((1, addr));
        }
        if let Some(addr) = self.marketplace_v2 {
            out.push((2, addr));
        }
        out
    }

    pub fn versions(&self) -> Vec<u32> {
        self.marketplaces().into_iter().map(|(v, _)| v).collect()
    }

    pub fn payment_token(&self, address: Address) -> Option<&PaymentToken> {
        self.payment_tokens.iter().find(|t| t.address == address)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    fn env_suffix(&self) -> String {
        self.name.to_uppercase().replace(&['-', ' '][..], "_")
    }
}

fn default_oracle_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}
fn default_price_cache_ttl_seconds() -> u64 {
    60
}
fn default_oracle_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceOracleSettings {
    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_price_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PriceOracleSettings {
    fn default() -> Self {
        Self {
            base_url: default_oracle_base_url(),
            api_key: None,
            cache_ttl_seconds: default_price_cache_ttl_seconds(),
            timeout_ms: default_oracle_timeout_ms(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/assets")
}
fn default_public_base_url() -> String {
    "https://assets.localhost/cache/".to_string()
}
fn default_ipfs_gateway() -> String {
    "https://ipfs.io/ipfs/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetSettings {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Prefix of every managed image reference.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_ipfs_gateway")]
    pub ipfs_gateway: String,
    #[serde(default)]
    pub pin_endpoint: Option<String>,
    #[serde(default)]
    pub pin_api_key: Option<String>,
    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            public_base_url: default_public_base_url(),
            ipfs_gateway: default_ipfs_gateway(),
            pin_endpoint: None,
            pin_api_key: None,
            timeout_ms: default_oracle_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub sync: SyncSettings,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub price_oracle: PriceOracleSettings,
    #[serde(default)]
    pub assets: AssetSettings,
}

impl Settings {
    /// Load `Config.toml` from the working directory, then apply env overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder().add_source(File::with_name(path)).build()?;
        let mut settings: Self = s.try_deserialize()?;
        settings.apply_overrides(|key| env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `MARKET_SYNC_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read_u64 = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(e) => {
                    log::warn!("Ignoring {}={:?}: {}", key, raw, e);
                    None
                }
            }
        };

        if let Some(v) = read_u64("MARKET_SYNC_CACHE_TTL_MINUTES") {
            self.sync.cache_ttl_minutes = v;
        }
        if let Some(v) = read_u64("MARKET_SYNC_INTERVAL_SECONDS") {
            self.sync.interval_seconds = v;
        }
        if let Some(v) = read_u64("MARKET_SYNC_THROTTLE_DELAY_MS") {
            self.sync.throttle_delay_ms = v;
        }
        if let Some(v) = read_u64("MARKET_SYNC_MAX_PASS_SECONDS") {
            self.sync.max_pass_seconds = v;
        }
        if let Some(v) = read_u64("MARKET_SYNC_MAX_PASS_SECONDS_BOOTSTRAP") {
            self.sync.max_pass_seconds_bootstrap = v;
        }
        if let Some(v) = read_u64("MARKET_SYNC_MAX_BLOCKS_PER_PASS") {
            self.sync.max_blocks_per_pass = v;
        }
        if let Some(path) = lookup("MARKET_SYNC_SNAPSHOT_PATH") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                self.sync.snapshot_path = PathBuf::from(trimmed);
            }
        }
        if let Some(key) = lookup("MARKET_SYNC_PRICE_API_KEY") {
            if !key.trim().is_empty() {
                self.price_oracle.api_key = Some(key.trim().to_string());
            }
        }

        for chain in &mut self.chains {
            let suffix = chain.env_suffix();
            if let Some(v) = read_u64(&format!("MARKET_SYNC_START_BLOCK_{}", suffix)) {
                chain.start_block = v;
            }
            if let Some(url) = lookup(&format!("MARKET_SYNC_RPC_URL_{}", suffix)) {
                if !url.trim().is_empty() {
                    chain.rpc_url = url.trim().to_string();
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.cache_ttl_minutes == 0 {
            return Err(ConfigError::Message("sync.cache_ttl_minutes must be > 0".into()));
        }
        if self.sync.scan_window_blocks == 0 {
            return Err(ConfigError::Message("sync.scan_window_blocks must be > 0".into()));
        }
        if self.sync.max_blocks_per_pass == 0 {
            return Err(ConfigError::Message("sync.max_blocks_per_pass must be > 0".into()));
        }
        let mut names = HashSet::new();
        for chain in &self.chains {
            if !names.insert(chain.name.as_str()) {
                return Err(ConfigError::Message(format!("duplicate chain name '{}'", chain.name)));
            }
            url::Url::parse(&chain.rpc_url).map_err(|e| {
                ConfigError::Message(format!("invalid rpc_url for chain '{}': {}", chain.name, e))
            })?;
            if chain.marketplaces().is_empty() {
                return Err(ConfigError::Message(format!(
                    "chain '{}' has no marketplace contract configured",
                    chain.name
                )));
            }
        }
        Ok(())
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }
}
