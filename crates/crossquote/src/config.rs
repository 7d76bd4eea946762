use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

use crate::{
    errors::CoreError,
    retry::BackoffConfig,
    types::ChainId,
};

pub const SOLANA_MAINNET_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
pub const LIFI_BASE_URL: &str = "https://li.quest/v1";

/// Placeholder substituted with the Alchemy API key when the config is loaded.
pub const ALCHEMY_KEY_PLACEHOLDER: &str = "{alchemy_api_key}";
pub const HELIUS_KEY_PLACEHOLDER: &str = "{helius_api_key}";

fn is_loopback_http(url: &str) -> bool {
    fn host_prefix_ok(s: &str, prefix: &str) -> bool {
        if !s.starts_with(prefix) {
            return false;
        }
        matches!(s.as_bytes().get(prefix.len()), None | Some(b':' | b'/'))
    }
    let u = url.trim();
    host_prefix_ok(u, "http://127.0.0.1")
        || host_prefix_ok(u, "http://localhost")
        || host_prefix_ok(u, "http://[::1]")
}

pub fn ensure_https_or_loopback(url: &str, name: &str) -> Result<(), CoreError> {
    let u = url.trim();
    if u.starts_with("https://") || is_loopback_http(u) {
        return Ok(());
    }
    Err(CoreError::InvalidInput(format!(
        "{name} must use https (or http://localhost for local testing)"
    )))
}

/// A configured EVM network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmChainConfig {
    pub chain_id: u64,
    /// Endpoint that serves `alchemy_getTokenBalances` as well as standard `eth_*` calls.
    pub rpc_url: String,
    #[serde(default)]
    pub fallback_rpc_urls: Vec<String>,
}

impl EvmChainConfig {
    /// Primary endpoint followed by de-duplicated fallbacks. Entries still carrying an
    /// unresolved API-key placeholder are skipped.
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::with_capacity(1 + self.fallback_rpc_urls.len());
        for u in std::iter::once(&self.rpc_url).chain(&self.fallback_rpc_urls) {
            let t = u.trim();
            if t.is_empty() || t.contains(ALCHEMY_KEY_PLACEHOLDER) || urls.iter().any(|x| x == t) {
                continue;
            }
            urls.push(t.to_owned());
        }
        urls
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// EVM networks keyed by chain name.
    pub evm: BTreeMap<String, EvmChainConfig>,
    /// Solana RPC endpoint URL.
    pub solana_rpc_url: String,
    /// Additional Solana endpoints to try if the primary fails.
    pub solana_fallback_rpc_urls: Vec<String>,
}

/// A single EVM chain definition used by the table-driven [`RpcConfig::default()`].
struct EvmChainDef {
    name: &'static str,
    chain_id: u64,
    alchemy_network: &'static str,
}

const EVM_CHAINS: &[EvmChainDef] = &[
    EvmChainDef {
        name: "ethereum",
        chain_id: 1,
        alchemy_network: "eth-mainnet",
    },
    EvmChainDef {
        name: "base",
        chain_id: 8453,
        alchemy_network: "base-mainnet",
    },
    EvmChainDef {
        name: "polygon",
        chain_id: 137,
        alchemy_network: "polygon-mainnet",
    },
    EvmChainDef {
        name: "sepolia",
        chain_id: 11_155_111,
        alchemy_network: "eth-sepolia",
    },
];

impl Default for RpcConfig {
    fn default() -> Self {
        let evm = EVM_CHAINS
            .iter()
            .map(|def| {
                (
                    def.name.to_owned(),
                    EvmChainConfig {
                        chain_id: def.chain_id,
                        rpc_url: format!(
                            "https://{}.g.alchemy.com/v2/{ALCHEMY_KEY_PLACEHOLDER}",
                            def.alchemy_network
                        ),
                        fallback_rpc_urls: vec![],
                    },
                )
            })
            .collect();

        Self {
            evm,
            solana_rpc_url: format!("https://mainnet.helius-rpc.com/?api-key={HELIUS_KEY_PLACEHOLDER}"),
            solana_fallback_rpc_urls: vec![
                SOLANA_MAINNET_RPC_URL.into(),
                "https://solana-rpc.publicnode.com".into(),
            ],
        }
    }
}

impl RpcConfig {
    pub fn evm_chain(&self, chain_id: ChainId) -> Option<(&str, &EvmChainConfig)> {
        self.evm
            .iter()
            .find(|(_, c)| c.chain_id == chain_id.0)
            .map(|(name, c)| (name.as_str(), c))
    }

    /// Primary first, then fallbacks. A URL still holding the Helius placeholder is skipped, so the
    /// public endpoints serve until a key is set.
    pub fn solana_rpc_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = vec![];
        for u in std::iter::once(&self.solana_rpc_url).chain(&self.solana_fallback_rpc_urls) {
            let t = u.trim();
            if t.is_empty() || t.contains(HELIUS_KEY_PLACEHOLDER) || urls.iter().any(|x| x == t) {
                continue;
            }
            urls.push(t.to_owned());
        }
        urls
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Token metadata service base URL (serves `GET /tokens?chains=<id>`).
    pub token_service_base_url: String,
    /// Swap quote service base URL (serves `GET /quote`).
    pub quote_service_base_url: String,
    /// Optional API key sent as `x-lifi-api-key`.
    pub lifi_api_key: Option<String>,
    /// Bitcoin HTTP API base URL (Blockstream-compatible).
    pub bitcoin_api_base_url: String,
    /// Per-request timeout for every upstream call (seconds).
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            token_service_base_url: LIFI_BASE_URL.into(),
            quote_service_base_url: LIFI_BASE_URL.into(),
            lifi_api_key: None,
            bitcoin_api_base_url: "https://blockstream.info/api".into(),
            timeout_seconds: 20,
        }
    }
}

impl HttpConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Token catalogs change rarely.
    pub catalog_ttl_seconds: u64,
    pub balance_ttl_seconds: u64,
    /// How often native-balance feeds poll their chain.
    pub native_poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            catalog_ttl_seconds: 5 * 60,
            balance_ttl_seconds: 30,
            native_poll_interval_ms: 4_000,
        }
    }
}

impl CacheConfig {
    pub const fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_seconds)
    }

    pub const fn balance_ttl(&self) -> Duration {
        Duration::from_secs(self.balance_ttl_seconds)
    }

    pub const fn native_poll_interval(&self) -> Duration {
        Duration::from_millis(self.native_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts before a transport failure is surfaced.
    pub attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 400,
            max_delay_ms: 4_000,
            jitter_max_ms: 250,
        }
    }
}

impl RetryConfig {
    pub const fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            rounds: self.attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_max_ms: self.jitter_max_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteConfig {
    pub retry: RetryConfig,
    /// Quiet period after an input change before a quote request is sent.
    pub debounce_ms: u64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            debounce_ms: 300,
        }
    }
}

impl QuoteConfig {
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossQuoteConfig {
    pub rpc: RpcConfig,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    /// Retry budget for RPC and catalog calls.
    pub retry: RetryConfig,
    pub quote: QuoteConfig,
}

impl CrossQuoteConfig {
    /// Substitute API keys into endpoint templates.
    pub fn apply_api_keys(&mut self, alchemy: Option<&str>, helius: Option<&str>) {
        if let Some(key) = alchemy.map(str::trim).filter(|k| !k.is_empty()) {
            for chain in self.rpc.evm.values_mut() {
                chain.rpc_url = chain.rpc_url.replace(ALCHEMY_KEY_PLACEHOLDER, key);
                for u in &mut chain.fallback_rpc_urls {
                    *u = u.replace(ALCHEMY_KEY_PLACEHOLDER, key);
                }
            }
        }
        if let Some(key) = helius.map(str::trim).filter(|k| !k.is_empty()) {
            self.rpc.solana_rpc_url = self.rpc.solana_rpc_url.replace(HELIUS_KEY_PLACEHOLDER, key);
            for u in &mut self.rpc.solana_fallback_rpc_urls {
                *u = u.replace(HELIUS_KEY_PLACEHOLDER, key);
            }
        }
    }

    /// Chain ids with a usable balance endpoint.
    pub fn supported_chain_ids(&self) -> Vec<ChainId> {
        let mut out: Vec<ChainId> = self
            .rpc
            .evm
            .values()
            .filter(|c| !c.all_rpc_urls().is_empty())
            .map(|c| ChainId(c.chain_id))
            .collect();
        if !self.rpc.solana_rpc_urls().is_empty() {
            out.push(ChainId::SOLANA);
        }
        out
    }
}
