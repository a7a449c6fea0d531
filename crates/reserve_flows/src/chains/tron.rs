//! Tron TRC20 tokens over a TronScan-compatible REST API.
//!
//! A flow call stages every transfer it reads and merges only after the last page, so a
//! failed call leaves the caller's book as it was. Cancellation is the exception: what was
//! staged before it is merged, then the call reports `Cancelled`/`DeadlineExceeded`.

use crate::chains::{unsupported, Asset, AssetBalance, AssetKind, ChainAdapter, ChainKind, FlowError, Holding};
use crate::flow::{parse_decimal_quantity, to_decimal, Direction, FlowBook, Window};
use crate::net::{PageGuard, PagingLimits, RequestClient};
use crate::scan::ScanContext;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

/// TRC20 stablecoins on Tron use six decimals.
pub const DEFAULT_TRC20_DECIMALS: u32 = 6;
pub const API_KEY_HEADER: &str = "TRON-PRO-API-KEY";
const TOKENS_LIMIT: usize = 200;
const TRANSFER_PAGE_SIZE: usize = 50;
const DEFAULT_PAGE_CEILING: u32 = 200;

#[derive(Deserialize)]
struct AccountTokens {
    #[serde(default)]
    data: Vec<TokenEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenEntry {
    token_id: String,
    #[serde(default)]
    token_decimal: Option<u32>,
    balance: String,
}

#[derive(Deserialize)]
struct TransferPage {
    #[serde(default)]
    token_transfers: Vec<Trc20Transfer>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Deserialize)]
struct Trc20Transfer {
    transaction_id: String,
    /// Milliseconds since the epoch.
    block_ts: i64,
    from_address: String,
    to_address: String,
    quant: String,
    #[serde(default)]
    contract_address: Option<String>,
    #[serde(rename = "tokenInfo", default)]
    token_info: Option<TransferTokenInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferTokenInfo {
    #[serde(default)]
    token_decimal: Option<u32>,
}

/// One in-window transfer leg waiting for the call to finish.
struct Staged {
    ts_ms: i64,
    direction: Direction,
    amount: Decimal,
}

pub struct TronAdapter {
    id: String,
    client: RequestClient,
    base_url: String,
    api_key: Option<String>,
    assets: Vec<Asset>,
    allowed_symbols: Vec<String>,
    limits: PagingLimits,
}

impl TronAdapter {
    pub fn new(id: impl Into<String>, client: RequestClient, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client,
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            api_key: None,
            assets: Vec::new(),
            allowed_symbols: Vec::new(),
            limits: PagingLimits {
                max_pages: DEFAULT_PAGE_CEILING,
                ..PagingLimits::default()
            },
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_token(mut self, symbol: impl Into<String>, contract: impl Into<String>, decimals: Option<u32>) -> Self {
        self.assets.push(Asset::token(symbol, contract, decimals));
        self
    }

    /// Restrict snapshots to these symbols. Empty means every configured token.
    pub fn with_allowed_symbols(mut self, symbols: Vec<String>) -> Self {
        self.allowed_symbols = symbols;
        self
    }

    pub fn with_page_ceiling(mut self, max_pages: u32) -> Self {
        self.limits.max_pages = max_pages;
        self
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.api_key
            .iter()
            .map(|k| (API_KEY_HEADER.to_string(), k.clone()))
            .collect()
    }

    fn allowed(&self, symbol: &str) -> bool {
        self.allowed_symbols.is_empty()
            || self
                .allowed_symbols
                .iter()
                .any(|s| s.eq_ignore_ascii_case(symbol))
    }

    fn configured(&self, contract: &str) -> Option<&Asset> {
        self.assets
            .iter()
            .find(|a| a.contract().is_some_and(|c| c.eq_ignore_ascii_case(contract)))
    }

    /// Every configured, allowed token the account holds, from a single listing call.
    pub async fn compute_balances(&self, address: &str, ctx: &ScanContext) -> Result<Vec<Holding>, FlowError> {
        let url = format!(
            "{}/api/account/tokens?address={}&start=0&limit={}",
            self.base_url,
            urlencoding::encode(address),
            TOKENS_LIMIT
        );
        let listing: AccountTokens = ctx.guard(self.client.get_json(&url, &self.headers())).await?;
        let mut out = Vec::new();
        for entry in &listing.data {
            let Some(asset) = self.configured(&entry.token_id) else {
                continue;
            };
            if !self.allowed(&asset.symbol) {
                continue;
            }
            let decimals = entry
                .token_decimal
                .or(asset.decimals)
                .unwrap_or(DEFAULT_TRC20_DECIMALS);
            out.push(Holding {
                chain: self.id.clone(),
                symbol: asset.symbol.clone(),
                amount: to_decimal(parse_decimal_quantity(&entry.balance)?, decimals)?,
                decimals,
            });
        }
        debug!(
            chain = %self.id,
            listed = listing.data.len(),
            kept = out.len(),
            "tron tokens"
        );
        Ok(out)
    }

    /// TRC20 transfers of `asset` touching `address` inside `window`.
    pub async fn compute_flows(
        &self,
        address: &str,
        asset: &Asset,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError> {
        let Some(contract) = asset.contract() else {
            return Err(unsupported(&self.id, asset, "only TRC20 tokens are tracked"));
        };
        let fallback_decimals = asset.decimals.unwrap_or(DEFAULT_TRC20_DECIMALS);
        let mut staged: Vec<Staged> = Vec::new();
        let paged = self
            .stage_transfers(address, contract, fallback_decimals, window, &mut staged, ctx)
            .await;
        let paged = match paged {
            Err(e) if !matches!(e, FlowError::Cancelled | FlowError::DeadlineExceeded) => return Err(e),
            other => other,
        };

        let mut merged = 0usize;
        for s in staged {
            if book.record_unix(&asset.symbol, s.ts_ms.div_euclid(1000), s.direction, s.amount) {
                merged += 1;
            }
        }
        let pages = paged?;
        info!(chain = %self.id, symbol = %asset.symbol, pages, merged, "tron flows");
        Ok(merged)
    }

    /// Reads pages into `staged` until an older transfer or the last page. Returns the page
    /// count.
    async fn stage_transfers(
        &self,
        address: &str,
        contract: &str,
        fallback_decimals: u32,
        window: &Window,
        staged: &mut Vec<Staged>,
        ctx: &ScanContext,
    ) -> Result<u32, FlowError> {
        let headers = self.headers();
        let mut guard = PageGuard::new(self.limits.clone());
        let mut start = 0usize;

        loop {
            let url = format!(
                "{}/api/token_trc20/transfers?relatedAddress={}&contract_address={}&start={}&limit={}",
                self.base_url,
                urlencoding::encode(address),
                urlencoding::encode(contract),
                start,
                TRANSFER_PAGE_SIZE
            );
            let page: TransferPage = ctx.guard(self.client.get_json(&url, &headers)).await?;
            guard.record_page()?;

            let mut older_seen = false;
            for t in &page.token_transfers {
                if window.is_before_millis(t.block_ts) {
                    older_seen = true;
                    continue;
                }
                if !window.contains_millis(t.block_ts) {
                    continue;
                }
                if t
                    .contract_address
                    .as_deref()
                    .is_some_and(|c| !c.eq_ignore_ascii_case(contract))
                {
                    continue;
                }
                let decimals = t
                    .token_info
                    .as_ref()
                    .and_then(|i| i.token_decimal)
                    .unwrap_or(fallback_decimals);
                let amount = to_decimal(parse_decimal_quantity(&t.quant)?, decimals)?;
                if t.to_address.eq_ignore_ascii_case(address) {
                    staged.push(Staged {
                        ts_ms: t.block_ts,
                        direction: Direction::Inflow,
                        amount,
                    });
                }
                if t.from_address.eq_ignore_ascii_case(address) {
                    staged.push(Staged {
                        ts_ms: t.block_ts,
                        direction: Direction::Outflow,
                        amount,
                    });
                }
            }

            start += page.token_transfers.len();
            let exhausted = page.token_transfers.len() < TRANSFER_PAGE_SIZE
                || page.total.is_some_and(|total| start as u64 >= total);
            if older_seen || exhausted {
                return Ok(guard.pages());
            }
            if let Some(last) = page.token_transfers.last() {
                debug!(chain = %self.id, start, last = %last.transaction_id, "tron page");
            }
            guard.advance(&start.to_string())?;
        }
    }
}

#[async_trait]
impl ChainAdapter for TronAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Tron
    }

    fn assets(&self) -> &[Asset] {
        &self.assets
    }

    async fn balance(&self, address: &str, asset: &Asset, ctx: &ScanContext) -> Result<Holding, FlowError> {
        let AssetKind::Token { .. } = asset.kind else {
            return Err(unsupported(&self.id, asset, "only TRC20 tokens are tracked"));
        };
        let holdings = self.compute_balances(address, ctx).await?;
        Ok(holdings
            .into_iter()
            .find(|h| h.symbol == asset.symbol)
            .unwrap_or_else(|| Holding {
                chain: self.id.clone(),
                symbol: asset.symbol.clone(),
                amount: Decimal::ZERO,
                decimals: asset.decimals.unwrap_or(DEFAULT_TRC20_DECIMALS),
            }))
    }

    /// One listing call for all tokens. A failed call is reported against every allowed
    /// token.
    async fn balances(&self, address: &str, ctx: &ScanContext) -> Vec<AssetBalance> {
        match self.compute_balances(address, ctx).await {
            Ok(holdings) => holdings
                .into_iter()
                .map(|h| (h.symbol.clone(), Ok(h)))
                .collect(),
            Err(e) => self
                .assets
                .iter()
                .filter(|a| self.allowed(&a.symbol))
                .map(|a| (a.symbol.clone(), Err(e.clone())))
                .collect(),
        }
    }

    async fn flows(
        &self,
        address: &str,
        asset: &Asset,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError> {
        self.compute_flows(address, asset, window, book, ctx).await
    }
}
