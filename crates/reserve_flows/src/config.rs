//! Scan configuration: timeouts, reporting offset and the chains to register.
//!
//! Load from: an explicit path, or env `RESERVE_FLOWS_CONFIG`, or `./config/reserve_flows.json`,
//! or `./reserve_flows.json`.

use crate::chains::evm::HistoryApi;
use crate::chains::{BitcoinAdapter, ChainRegistry, EvmAdapter, SolanaAdapter, TronAdapter};
use crate::net::{BackoffPolicy, PagingLimits, RequestClient, Transport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::macros::format_description;
use time::UtcOffset;
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "RESERVE_FLOWS_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {message}")]
    Read { path: String, message: String },
    #[error("parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("no config file found (set RESERVE_FLOWS_CONFIG or pass a path)")]
    NotFound,
    #[error("invalid reporting offset {0:?}, expected e.g. \"+08:00\"")]
    Offset(String),
    #[error("duplicate chain id {0}")]
    DuplicateChain(String),
    #[error("chain {chain}: {message}")]
    Chain { chain: String, message: String },
}

/// ERC20 contract, SPL mint or TRC20 contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    #[serde(alias = "mint")]
    pub contract: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainConfig {
    Bitcoin {
        id: String,
        /// Comma-separated Esplora base URLs, tried in order.
        base_urls: String,
        #[serde(default = "default_btc_symbol")]
        symbol: String,
        #[serde(default)]
        backoff: BackoffPolicy,
        #[serde(default)]
        limits: PagingLimits,
    },
    Evm {
        id: String,
        rpc_url: String,
        symbol: String,
        /// Etherscan-compatible endpoint used for native-coin history.
        #[serde(default)]
        history_api_url: Option<String>,
        #[serde(default)]
        api_key: Option<String>,
        /// Environment variable holding the history API key; wins over `api_key`.
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default)]
        tokens: Vec<TokenConfig>,
        /// Ceiling for native-history pages.
        #[serde(default)]
        limits: PagingLimits,
    },
    Solana {
        id: String,
        rpc_url: String,
        #[serde(default = "default_sol_symbol")]
        symbol: String,
        #[serde(default)]
        tokens: Vec<TokenConfig>,
        #[serde(default)]
        limits: PagingLimits,
    },
    Tron {
        id: String,
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default)]
        tokens: Vec<TokenConfig>,
        /// Symbols reported in snapshots; empty means all configured tokens.
        #[serde(default)]
        allowed_symbols: Vec<String>,
        #[serde(default)]
        max_pages: Option<u32>,
    },
}

fn default_btc_symbol() -> String {
    "BTC".to_string()
}

fn default_sol_symbol() -> String {
    "SOL".to_string()
}

impl ChainConfig {
    pub fn id(&self) -> &str {
        match self {
            ChainConfig::Bitcoin { id, .. }
            | ChainConfig::Evm { id, .. }
            | ChainConfig::Solana { id, .. }
            | ChainConfig::Tron { id, .. } => id,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub request_timeout_secs: u64,
    pub metadata_timeout_secs: u64,
    /// UTC offset for daily buckets, e.g. `"+08:00"`.
    pub reporting_offset: String,
    pub chains: Vec<ChainConfig>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            metadata_timeout_secs: 5,
            reporting_offset: "+00:00".to_string(),
            chains: Vec::new(),
        }
    }
}

/// Key from `env_var` when set and non-empty, else the inline key.
fn resolve_key(inline: &Option<String>, env_var: &Option<String>) -> Option<String> {
    env_var
        .as_deref()
        .and_then(|v| std::env::var(v).ok())
        .filter(|k| !k.trim().is_empty())
        .or_else(|| inline.clone().filter(|k| !k.trim().is_empty()))
}

impl ScanConfig {
    pub fn from_json(json: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&content, &path.display().to_string())
    }

    /// `path` if given, else env `RESERVE_FLOWS_CONFIG`, else the first default location.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            return Self::load_from_path(p);
        }
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::load_from_path(Path::new(&env_path));
        }
        let candidates = [
            PathBuf::from("./config/reserve_flows.json"),
            PathBuf::from("./reserve_flows.json"),
        ];
        match candidates.iter().find(|c| c.exists()) {
            Some(p) => Self::load_from_path(p),
            None => Err(ConfigError::NotFound),
        }
    }

    pub fn reporting_offset(&self) -> Result<UtcOffset, ConfigError> {
        let s = self.reporting_offset.trim();
        if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
            return Ok(UtcOffset::UTC);
        }
        UtcOffset::parse(s, format_description!("[offset_hour sign:mandatory]:[offset_minute]"))
            .map_err(|_| ConfigError::Offset(self.reporting_offset.clone()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs.max(1))
    }

    /// Request client over `transport` with the configured timeouts.
    pub fn client(&self, transport: Arc<dyn Transport>) -> RequestClient {
        RequestClient::new(transport).with_timeouts(self.request_timeout(), self.metadata_timeout())
    }

    /// One adapter per configured chain, all sharing `client`.
    pub fn build_registry(&self, client: &RequestClient) -> Result<ChainRegistry, ConfigError> {
        let mut registry = ChainRegistry::new();
        for chain in &self.chains {
            if registry.get(chain.id()).is_ok() {
                return Err(ConfigError::DuplicateChain(chain.id().to_string()));
            }
            let invalid = |message: &str| ConfigError::Chain {
                chain: chain.id().to_string(),
                message: message.to_string(),
            };
            match chain {
                ChainConfig::Bitcoin {
                    id,
                    base_urls,
                    symbol,
                    backoff,
                    limits,
                } => {
                    let urls = BitcoinAdapter::parse_base_urls(base_urls);
                    if urls.is_empty() {
                        return Err(invalid("base_urls is empty"));
                    }
                    let adapter = BitcoinAdapter::new(id.as_str(), client.clone(), urls, symbol.as_str())
                        .with_backoff(backoff.clone())
                        .with_limits(limits.clone());
                    registry.register(Arc::new(adapter));
                }
                ChainConfig::Evm {
                    id,
                    rpc_url,
                    symbol,
                    history_api_url,
                    api_key,
                    api_key_env,
                    tokens,
                    limits,
                } => {
                    if rpc_url.trim().is_empty() {
                        return Err(invalid("rpc_url is empty"));
                    }
                    let mut adapter = EvmAdapter::new(id.as_str(), client.clone(), rpc_url.trim(), symbol.as_str())
                        .with_limits(limits.clone());
                    if let Some(url) = history_api_url.as_deref().filter(|u| !u.trim().is_empty()) {
                        adapter = adapter.with_history_api(HistoryApi {
                            url: url.trim().to_string(),
                            api_key: resolve_key(api_key, api_key_env),
                        });
                    }
                    for t in tokens {
                        adapter = adapter.with_token(t.symbol.as_str(), t.contract.as_str());
                    }
                    registry.register(Arc::new(adapter));
                }
                ChainConfig::Solana {
                    id,
                    rpc_url,
                    symbol,
                    tokens,
                    limits,
                } => {
                    if rpc_url.trim().is_empty() {
                        return Err(invalid("rpc_url is empty"));
                    }
                    let mut adapter = SolanaAdapter::new(id.as_str(), client.clone(), rpc_url.trim(), symbol.as_str())
                        .with_limits(limits.clone());
                    for t in tokens {
                        adapter = adapter.with_token(t.symbol.as_str(), t.contract.as_str(), t.decimals);
                    }
                    registry.register(Arc::new(adapter));
                }
                ChainConfig::Tron {
                    id,
                    base_url,
                    api_key,
                    api_key_env,
                    tokens,
                    allowed_symbols,
                    max_pages,
                } => {
                    if tokens.is_empty() {
                        return Err(invalid("no TRC20 tokens configured"));
                    }
                    let mut adapter = TronAdapter::new(id.as_str(), client.clone(), base_url.as_str())
                        .with_allowed_symbols(allowed_symbols.clone());
                    if let Some(key) = resolve_key(api_key, api_key_env) {
                        adapter = adapter.with_api_key(key);
                    }
                    if let Some(n) = max_pages {
                        adapter = adapter.with_page_ceiling(*n);
                    }
                    for t in tokens {
                        adapter = adapter.with_token(t.symbol.as_str(), t.contract.as_str(), t.decimals);
                    }
                    registry.register(Arc::new(adapter));
                }
            }
        }
        info!(chains = registry.len(), "registry built");
        Ok(registry)
    }
}
