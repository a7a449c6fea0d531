//! Chain adapters behind one capability trait, resolved by chain id.

pub mod bitcoin;
pub mod evm;
pub mod solana;
pub mod tron;

use crate::flow::{FlowBook, UnitsError, Window};
use crate::net::{PagingError, RequestError};
use crate::scan::ScanContext;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use bitcoin::BitcoinAdapter;
pub use evm::EvmAdapter;
pub use solana::SolanaAdapter;
pub use tron::TronAdapter;

#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("request: {0}")]
    Request(#[from] RequestError),
    #[error("units: {0}")]
    Units(#[from] UnitsError),
    #[error("paging: {0}")]
    Paging(#[from] PagingError),
    #[error("gave up after {attempts} consecutive errors; last: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("all {providers} providers failed; last: {last}")]
    AllProvidersFailed { providers: usize, last: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{chain}: {symbol} unsupported: {reason}")]
    UnsupportedAsset {
        chain: String,
        symbol: String,
        reason: String,
    },
    #[error("no adapter registered for chain {0}")]
    UnknownChain(String),
}

/// The four chain families. Each needs its own protocol integration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    Bitcoin,
    Evm,
    Solana,
    Tron,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetKind {
    Native,
    /// ERC20/TRC20 contract or SPL mint.
    Token { contract: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub symbol: String,
    pub kind: AssetKind,
    /// Configured exponent; only a fallback where the chain reports its own.
    pub decimals: Option<u32>,
}

impl Asset {
    pub fn native(symbol: impl Into<String>, decimals: u32) -> Self {
        Self {
            symbol: symbol.into(),
            kind: AssetKind::Native,
            decimals: Some(decimals),
        }
    }

    pub fn token(symbol: impl Into<String>, contract: impl Into<String>, decimals: Option<u32>) -> Self {
        Self {
            symbol: symbol.into(),
            kind: AssetKind::Token {
                contract: contract.into(),
            },
            decimals,
        }
    }

    pub fn contract(&self) -> Option<&str> {
        match &self.kind {
            AssetKind::Native => None,
            AssetKind::Token { contract } => Some(contract),
        }
    }
}

/// One balance line of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Holding {
    pub chain: String,
    pub symbol: String,
    pub amount: Decimal,
    pub decimals: u32,
}

/// Per-asset balance result, so one failed asset does not hide the others.
pub type AssetBalance = (String, Result<Holding, FlowError>);

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Registry key, e.g. `btc`, `eth`, `bsc`.
    fn id(&self) -> &str;
    fn kind(&self) -> ChainKind;
    /// Native coin first, then configured tokens.
    fn assets(&self) -> &[Asset];

    async fn balance(&self, address: &str, asset: &Asset, ctx: &ScanContext) -> Result<Holding, FlowError>;

    /// Balances for every configured asset.
    async fn balances(&self, address: &str, ctx: &ScanContext) -> Vec<AssetBalance> {
        let mut out = Vec::with_capacity(self.assets().len());
        for asset in self.assets() {
            let res = self.balance(address, asset, ctx).await;
            out.push((asset.symbol.clone(), res));
        }
        out
    }

    /// Merge `address`'s flows of `asset` within `window` into `book`. Returns the number of
    /// ledger entries merged. On failure, entries merged before the error stay in `book`
    /// unless the adapter documents otherwise.
    async fn flows(
        &self,
        address: &str,
        asset: &Asset,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError>;
}

pub(crate) fn unsupported(chain: &str, asset: &Asset, reason: &str) -> FlowError {
    FlowError::UnsupportedAsset {
        chain: chain.to_string(),
        symbol: asset.symbol.clone(),
        reason: reason.to_string(),
    }
}

/// Adapters keyed by lower-cased chain id.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters
            .insert(adapter.id().to_ascii_lowercase(), adapter);
    }

    pub fn get(&self, chain: &str) -> Result<Arc<dyn ChainAdapter>, FlowError> {
        self.adapters
            .get(&chain.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| FlowError::UnknownChain(chain.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
