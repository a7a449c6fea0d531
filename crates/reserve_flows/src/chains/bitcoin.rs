//! Bitcoin over Esplora-compatible REST (blockstream.info, mempool.space).
//!
//! Flows come from scanning each transaction's inputs (prevouts the address owned,
//! outflow) and outputs (paid to the address, inflow). History is paged newest-first
//! with the last txid as continuation cursor, rotating across providers on error.

use crate::chains::{unsupported, Asset, AssetKind, ChainAdapter, ChainKind, FlowError, Holding};
use crate::flow::{to_decimal, Direction, FlowBook, Window};
use crate::net::{Advance, BackoffPolicy, PageGuard, PagingLimits, RequestClient, RetryState};
use crate::scan::ScanContext;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub const BTC_DECIMALS: u32 = 8;
/// Esplora returns confirmed history in pages of 25.
const PAGE_SIZE: usize = 25;

#[derive(Deserialize)]
struct AddressStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Deserialize)]
struct AddressSummary {
    chain_stats: AddressStats,
    mempool_stats: AddressStats,
}

#[derive(Deserialize)]
struct EsploraTx {
    txid: String,
    #[serde(default)]
    vin: Vec<EsploraVin>,
    #[serde(default)]
    vout: Vec<EsploraOutput>,
    status: EsploraStatus,
}

#[derive(Deserialize)]
struct EsploraVin {
    /// Absent for coinbase inputs.
    prevout: Option<EsploraOutput>,
}

#[derive(Deserialize)]
struct EsploraOutput {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Deserialize)]
struct EsploraStatus {
    block_time: Option<i64>,
}

pub struct BitcoinAdapter {
    id: String,
    client: RequestClient,
    base_urls: Vec<String>,
    assets: Vec<Asset>,
    policy: BackoffPolicy,
    limits: PagingLimits,
}

impl BitcoinAdapter {
    pub fn new(
        id: impl Into<String>,
        client: RequestClient,
        base_urls: Vec<String>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            base_urls: base_urls
                .into_iter()
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty())
                .collect(),
            assets: vec![Asset::native(symbol, BTC_DECIMALS)],
            policy: BackoffPolicy::default(),
            limits: PagingLimits::default(),
        }
    }

    /// Split a comma-separated provider list.
    pub fn parse_base_urls(csv: &str) -> Vec<String> {
        csv.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_limits(mut self, limits: PagingLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Confirmed plus mempool balance; the first provider that answers wins.
    pub async fn compute_balance(&self, address: &str, ctx: &ScanContext) -> Result<Holding, FlowError> {
        let mut last = String::from("no providers configured");
        for base in &self.base_urls {
            let url = format!("{}/address/{}", base, urlencoding::encode(address));
            match ctx.guard(self.client.get_json::<AddressSummary>(&url, &[])).await {
                Ok(summary) => {
                    let sats = net_funded(&summary.chain_stats) + net_funded(&summary.mempool_stats);
                    let sats = u128::try_from(sats)
                        .map_err(|_| FlowError::Decode(format!("negative balance {sats} for {address}")))?;
                    return Ok(Holding {
                        chain: self.id.clone(),
                        symbol: self.assets[0].symbol.clone(),
                        amount: to_decimal(sats, BTC_DECIMALS)?,
                        decimals: BTC_DECIMALS,
                    });
                }
                Err(FlowError::Request(e)) => {
                    warn!(chain = %self.id, provider = %base, error = %e, "balance provider failed");
                    last = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }
        Err(FlowError::AllProvidersFailed {
            providers: self.base_urls.len(),
            last,
        })
    }

    /// Merge in-window flows for `address` into `book` under `symbol`.
    pub async fn compute_flows(
        &self,
        address: &str,
        symbol: &str,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError> {
        if self.base_urls.is_empty() {
            return Err(FlowError::AllProvidersFailed {
                providers: 0,
                last: "no providers configured".to_string(),
            });
        }
        let mut guard = PageGuard::new(self.limits.clone());
        let mut retry = RetryState::new(self.base_urls.len());
        let mut rng = StdRng::from_entropy();
        let mut counted: HashSet<String> = HashSet::new();
        let mut merged = 0usize;

        loop {
            ctx.check()?;
            let base = &self.base_urls[retry.provider()];
            let encoded = urlencoding::encode(address);
            let url = match guard.cursor() {
                None => format!("{base}/address/{encoded}/txs/chain"),
                Some(last) => format!("{base}/address/{encoded}/txs/chain/{last}"),
            };
            let page: Vec<EsploraTx> = match ctx.guard(self.client.get_json(&url, &[])).await {
                Ok(page) => {
                    retry.record_success();
                    page
                }
                Err(FlowError::Request(e)) => {
                    let delay = retry.record_failure(&self.policy, e.is_retryable(), &mut rng);
                    warn!(
                        chain = %self.id,
                        provider = %base,
                        consecutive = retry.consecutive_errors(),
                        error = %e,
                        "history page failed"
                    );
                    if retry.consecutive_errors() >= self.limits.max_consecutive_errors {
                        return Err(FlowError::RetriesExhausted {
                            attempts: retry.consecutive_errors(),
                            last: e.to_string(),
                        });
                    }
                    if let Some(delay) = delay {
                        ctx.sleep(delay).await?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            guard.record_page()?;

            let mut reached_start = false;
            for tx in &page {
                let Some(ts) = tx.status.block_time else {
                    continue;
                };
                if window.is_before_unix(ts) {
                    reached_start = true;
                    continue;
                }
                if !window.contains_unix(ts) || !counted.insert(tx.txid.clone()) {
                    continue;
                }
                merged += merge_tx(tx, address, symbol, ts, book)?;
            }

            if reached_start || page.len() < PAGE_SIZE {
                break;
            }
            let Some(last) = page.last() else {
                break;
            };
            if guard.advance(&last.txid)? == Advance::Repeat {
                debug!(chain = %self.id, cursor = %last.txid, "page made no progress");
            }
        }

        info!(chain = %self.id, pages = guard.pages(), merged, "bitcoin flows");
        Ok(merged)
    }
}

fn net_funded(stats: &AddressStats) -> i128 {
    i128::from(stats.funded_txo_sum) - i128::from(stats.spent_txo_sum)
}

/// Sum the transaction's spends from and payments to `address`; returns entries merged.
fn merge_tx(
    tx: &EsploraTx,
    address: &str,
    symbol: &str,
    ts: i64,
    book: &mut FlowBook,
) -> Result<usize, FlowError> {
    let owned = |o: &EsploraOutput| {
        o.scriptpubkey_address
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(address))
    };
    let spent: u128 = tx
        .vin
        .iter()
        .filter_map(|i| i.prevout.as_ref())
        .filter(|&o| owned(o))
        .map(|o| u128::from(o.value))
        .sum();
    let received: u128 = tx
        .vout
        .iter()
        .filter(|&o| owned(o))
        .map(|o| u128::from(o.value))
        .sum();

    let mut merged = 0;
    let spends = tx.vin.iter().filter_map(|i| i.prevout.as_ref()).any(owned);
    if spends && book.record_unix(symbol, ts, Direction::Outflow, to_decimal(spent, BTC_DECIMALS)?) {
        merged += 1;
    }
    let receives = tx.vout.iter().any(owned);
    if receives && book.record_unix(symbol, ts, Direction::Inflow, to_decimal(received, BTC_DECIMALS)?) {
        merged += 1;
    }
    Ok(merged)
}

#[async_trait]
impl ChainAdapter for BitcoinAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Bitcoin
    }

    fn assets(&self) -> &[Asset] {
        &self.assets
    }

    async fn balance(&self, address: &str, asset: &Asset, ctx: &ScanContext) -> Result<Holding, FlowError> {
        match asset.kind {
            AssetKind::Native => self.compute_balance(address, ctx).await,
            AssetKind::Token { .. } => Err(unsupported(&self.id, asset, "no token ledger")),
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
        match asset.kind {
            AssetKind::Native => {
                self.compute_flows(address, &asset.symbol, window, book, ctx)
                    .await
            }
            AssetKind::Token { .. } => Err(unsupported(&self.id, asset, "no token ledger")),
        }
    }
}
