//! EVM chains: native and ERC20 balances over JSON-RPC, ERC20 flows from Transfer logs,
//! native flows from an Etherscan-compatible transaction-history API.

mod locator;

pub use locator::first_block_at_or_after;

use crate::chains::{unsupported, Asset, AssetKind, ChainAdapter, ChainKind, FlowError, Holding};
use crate::flow::{parse_decimal_quantity, parse_hex_quantity, to_decimal, Direction, FlowBook, Window, MAX_DECIMALS};
use crate::net::{strip_query, PageGuard, PagingLimits, RequestClient, RequestError};
use crate::scan::ScanContext;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub const NATIVE_DECIMALS: u32 = 18;
/// Used when a token's `decimals()` cannot be read.
pub const DEFAULT_TOKEN_DECIMALS: u32 = 18;
/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
const DECIMALS_SELECTOR: &str = "0x313ce567";
const BALANCE_OF_SELECTOR: &str = "0x70a08231";
const HISTORY_PAGE_SIZE: usize = 1000;
/// Etherscan-style APIs refuse `page * offset > 10000`; deeper history restarts at page 1
/// below the lowest block read so far.
const MAX_HISTORY_PAGES: u32 = 10;

#[derive(Deserialize)]
struct BlockHeader {
    timestamp: String,
}

#[derive(Deserialize)]
struct RpcLog {
    #[serde(rename = "blockNumber")]
    block_number: String,
    data: String,
    #[serde(default)]
    removed: bool,
}

#[derive(Deserialize)]
struct HistoryEnvelope {
    status: String,
    message: String,
    result: HistoryResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryResult {
    Transactions(Vec<HistoryTx>),
    Message(String),
}

#[derive(Deserialize)]
struct HistoryTx {
    #[serde(rename = "blockNumber", default)]
    block_number: String,
    #[serde(default)]
    hash: String,
    #[serde(rename = "timeStamp")]
    time_stamp: String,
    from: String,
    #[serde(default)]
    to: String,
    value: String,
    #[serde(rename = "gasUsed")]
    gas_used: String,
    #[serde(rename = "gasPrice")]
    gas_price: String,
    #[serde(rename = "isError", default)]
    is_error: String,
}

/// A history reply once `status`/`message` have been interpreted.
enum HistoryReply {
    Page(Vec<HistoryTx>),
    Empty,
    Failed(String),
}

impl From<HistoryEnvelope> for HistoryReply {
    fn from(env: HistoryEnvelope) -> Self {
        match (env.status.as_str(), env.result) {
            ("1", HistoryResult::Transactions(txs)) => HistoryReply::Page(txs),
            (_, HistoryResult::Transactions(txs)) if txs.is_empty() => HistoryReply::Empty,
            (_, _) if env.message.starts_with("No transactions found") => HistoryReply::Empty,
            (_, HistoryResult::Message(m)) => HistoryReply::Failed(format!("{}: {}", env.message, m)),
            (status, HistoryResult::Transactions(_)) => {
                HistoryReply::Failed(format!("status {status}: {}", env.message))
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct HistoryApi {
    pub url: String,
    pub api_key: Option<String>,
}

pub struct EvmAdapter {
    id: String,
    client: RequestClient,
    rpc_url: String,
    history: Option<HistoryApi>,
    assets: Vec<Asset>,
    limits: PagingLimits,
}

impl EvmAdapter {
    pub fn new(
        id: impl Into<String>,
        client: RequestClient,
        rpc_url: impl Into<String>,
        native_symbol: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            rpc_url: rpc_url.into(),
            history: None,
            assets: vec![Asset::native(native_symbol, NATIVE_DECIMALS)],
            limits: PagingLimits::default(),
        }
    }

    /// Ceiling for native-history pages across all block ranges.
    pub fn with_limits(mut self, limits: PagingLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_history_api(mut self, history: HistoryApi) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_token(mut self, symbol: impl Into<String>, contract: impl Into<String>) -> Self {
        self.assets.push(Asset::token(symbol, contract, None));
        self
    }

    pub async fn block_number(&self, ctx: &ScanContext) -> Result<u64, FlowError> {
        let hex: String = ctx
            .guard(self.client.rpc(&self.rpc_url, "eth_blockNumber", json!([])))
            .await?;
        u64::try_from(parse_hex_quantity(&hex)?)
            .map_err(|_| FlowError::Decode(format!("block number {hex}")))
    }

    pub async fn block_timestamp(&self, number: u64, ctx: &ScanContext) -> Result<i64, FlowError> {
        let header: Option<BlockHeader> = ctx
            .guard(self.client.rpc(
                &self.rpc_url,
                "eth_getBlockByNumber",
                json!([format!("0x{number:x}"), false]),
            ))
            .await?;
        let header = header.ok_or_else(|| FlowError::Decode(format!("block {number} not found")))?;
        i64::try_from(parse_hex_quantity(&header.timestamp)?)
            .map_err(|_| FlowError::Decode(format!("block {number} timestamp {}", header.timestamp)))
    }

    /// First block whose timestamp is `>= ts`; `latest + 1` if none yet.
    pub async fn locate_block_by_time(&self, ts: i64, ctx: &ScanContext) -> Result<u64, FlowError> {
        let latest = self.block_number(ctx).await?;
        self.locate_below(latest, ts, ctx).await
    }

    async fn locate_below(&self, latest: u64, ts: i64, ctx: &ScanContext) -> Result<u64, FlowError> {
        first_block_at_or_after(latest, ts, |n| self.block_timestamp(n, ctx)).await
    }

    pub async fn compute_balance(&self, address: &str, ctx: &ScanContext) -> Result<Holding, FlowError> {
        let hex: String = ctx
            .guard(self.client.rpc(&self.rpc_url, "eth_getBalance", json!([address, "latest"])))
            .await?;
        Ok(Holding {
            chain: self.id.clone(),
            symbol: self.assets[0].symbol.clone(),
            amount: to_decimal(parse_hex_quantity(&hex)?, NATIVE_DECIMALS)?,
            decimals: NATIVE_DECIMALS,
        })
    }

    /// `decimals()` read fresh on every call. Falls back to [`DEFAULT_TOKEN_DECIMALS`] when
    /// the contract does not answer sensibly.
    pub async fn token_decimals(&self, token: &str, ctx: &ScanContext) -> Result<u32, FlowError> {
        let call = json!([{ "to": token, "data": DECIMALS_SELECTOR }, "latest"]);
        let res: Result<String, FlowError> = ctx
            .guard(self.client.rpc_metadata(&self.rpc_url, "eth_call", call))
            .await;
        let raw = match res {
            Ok(raw) => raw,
            Err(e @ (FlowError::Cancelled | FlowError::DeadlineExceeded)) => return Err(e),
            Err(e) => {
                warn!(chain = %self.id, token, error = %e, "decimals() failed, using default");
                return Ok(DEFAULT_TOKEN_DECIMALS);
            }
        };
        let digits = raw.trim().trim_start_matches("0x");
        match parse_hex_quantity(&raw) {
            Ok(d) if !digits.is_empty() && d <= u128::from(MAX_DECIMALS) => Ok(d as u32),
            _ => {
                warn!(chain = %self.id, token, raw = %raw, "unusable decimals(), using default");
                Ok(DEFAULT_TOKEN_DECIMALS)
            }
        }
    }

    pub async fn compute_erc20_balance(
        &self,
        token: &str,
        owner: &str,
        symbol: &str,
        ctx: &ScanContext,
    ) -> Result<Holding, FlowError> {
        let decimals = self.token_decimals(token, ctx).await?;
        let data = format!("{}{}", BALANCE_OF_SELECTOR, pad_address(owner)?.trim_start_matches("0x"));
        let raw: String = ctx
            .guard(self.client.rpc(
                &self.rpc_url,
                "eth_call",
                json!([{ "to": token, "data": data }, "latest"]),
            ))
            .await?;
        Ok(Holding {
            chain: self.id.clone(),
            symbol: symbol.to_string(),
            amount: to_decimal(parse_hex_quantity(&raw)?, decimals)?,
            decimals,
        })
    }

    async fn transfer_logs(
        &self,
        token: &str,
        from_block: u64,
        to_block: u64,
        topics: serde_json::Value,
        ctx: &ScanContext,
    ) -> Result<Vec<RpcLog>, FlowError> {
        let filter = json!([{
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
            "address": token,
            "topics": topics,
        }]);
        ctx.guard(self.client.rpc(&self.rpc_url, "eth_getLogs", filter))
            .await
    }

    /// Transfer logs with `owner` as sender or recipient, re-filtered by exact block time.
    pub async fn compute_erc20_flows(
        &self,
        token: &str,
        owner: &str,
        symbol: &str,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError> {
        let topic = pad_address(owner)?;
        let latest = self.block_number(ctx).await?;
        let from_block = self.locate_below(latest, window.start_unix(), ctx).await?;
        if from_block > latest {
            debug!(chain = %self.id, token, "window starts after chain head");
            return Ok(0);
        }
        let to_block = self
            .locate_below(latest, window.end_unix(), ctx)
            .await?
            .min(latest);

        let sent = self
            .transfer_logs(token, from_block, to_block, json!([TRANSFER_TOPIC, topic]), ctx)
            .await?;
        let received = self
            .transfer_logs(token, from_block, to_block, json!([TRANSFER_TOPIC, null, topic]), ctx)
            .await?;
        let decimals = self.token_decimals(token, ctx).await?;

        let mut block_times: HashMap<u64, i64> = HashMap::new();
        let mut merged = 0usize;
        let tagged = sent
            .iter()
            .map(|l| (l, Direction::Outflow))
            .chain(received.iter().map(|l| (l, Direction::Inflow)));
        for (log, direction) in tagged {
            if log.removed {
                continue;
            }
            let number = u64::try_from(parse_hex_quantity(&log.block_number)?)
                .map_err(|_| FlowError::Decode(format!("log block {}", log.block_number)))?;
            let ts = match block_times.get(&number) {
                Some(ts) => *ts,
                None => {
                    let ts = self.block_timestamp(number, ctx).await?;
                    block_times.insert(number, ts);
                    ts
                }
            };
            if !window.contains_unix(ts) {
                continue;
            }
            let amount = to_decimal(parse_hex_quantity(&log.data)?, decimals)?;
            if book.record_unix(symbol, ts, direction, amount) {
                merged += 1;
            }
        }
        info!(chain = %self.id, token, from_block, to_block, merged, "erc20 flows");
        Ok(merged)
    }

    /// Received value is inflow; sent value plus gas fee is outflow.
    pub async fn compute_native_flows(
        &self,
        address: &str,
        symbol: &str,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError> {
        let Some(history) = &self.history else {
            return Err(unsupported(&self.id, &self.assets[0], "no transaction-history API configured"));
        };
        let latest = self.block_number(ctx).await?;
        let start_block = self.locate_below(latest, window.start_unix(), ctx).await?;
        if start_block > latest {
            return Ok(0);
        }
        let end_block = self
            .locate_below(latest, window.end_unix(), ctx)
            .await?
            .min(latest);

        let mut guard = PageGuard::new(self.limits.clone());
        let mut seen: HashSet<String> = HashSet::new();
        let mut upper = end_block;
        let mut page = 1u32;
        let mut merged = 0usize;
        loop {
            let url = history_url(history, address, start_block, upper, page);
            let envelope: HistoryEnvelope = ctx.guard(self.client.get_json(&url, &[])).await?;
            guard.record_page()?;
            let txs = match HistoryReply::from(envelope) {
                HistoryReply::Page(txs) => txs,
                HistoryReply::Empty => break,
                HistoryReply::Failed(msg) => {
                    return Err(FlowError::Request(RequestError::decode(strip_query(&url), msg)))
                }
            };
            let mut lowest: Option<u64> = None;
            for tx in &txs {
                if let Ok(n) = tx.block_number.parse::<u64>() {
                    lowest = Some(lowest.map_or(n, |l| l.min(n)));
                }
                // a restarted range re-reads its top block
                if !tx.hash.is_empty() && !seen.insert(tx.hash.to_ascii_lowercase()) {
                    continue;
                }
                merged += merge_native_tx(tx, address, symbol, window, book)?;
            }
            if txs.len() < HISTORY_PAGE_SIZE {
                break;
            }
            if page < MAX_HISTORY_PAGES {
                page += 1;
                continue;
            }
            let Some(lowest) = lowest else {
                return Err(FlowError::Decode("history page without block numbers".to_string()));
            };
            debug!(chain = %self.id, endblock = lowest, "history offset exhausted, restarting range");
            guard.advance(&lowest.to_string())?;
            upper = lowest;
            page = 1;
        }
        info!(chain = %self.id, pages = guard.pages(), merged, "native flows");
        Ok(merged)
    }
}

fn history_url(history: &HistoryApi, address: &str, start: u64, end: u64, page: u32) -> String {
    let sep = if history.url.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}module=account&action=txlist&address={}&startblock={}&endblock={}&page={}&offset={}&sort=desc",
        history.url,
        sep,
        urlencoding::encode(address),
        start,
        end,
        page,
        HISTORY_PAGE_SIZE
    );
    if let Some(key) = &history.api_key {
        url.push_str("&apikey=");
        url.push_str(&urlencoding::encode(key));
    }
    url
}

fn merge_native_tx(
    tx: &HistoryTx,
    address: &str,
    symbol: &str,
    window: &Window,
    book: &mut FlowBook,
) -> Result<usize, FlowError> {
    let Ok(ts) = tx.time_stamp.parse::<i64>() else {
        return Ok(0);
    };
    if !window.contains_unix(ts) {
        return Ok(0);
    }
    let failed = tx.is_error == "1";
    let value = parse_decimal_quantity(&tx.value)?;
    let mut merged = 0;
    if tx.to.eq_ignore_ascii_case(address)
        && !failed
        && book.record_unix(symbol, ts, Direction::Inflow, to_decimal(value, NATIVE_DECIMALS)?)
    {
        merged += 1;
    }
    if tx.from.eq_ignore_ascii_case(address) {
        let fee = parse_decimal_quantity(&tx.gas_used)?
            .checked_mul(parse_decimal_quantity(&tx.gas_price)?)
            .ok_or_else(|| FlowError::Decode(format!("fee overflow {} * {}", tx.gas_used, tx.gas_price)))?;
        let sent = if failed { 0 } else { value };
        let total = sent
            .checked_add(fee)
            .ok_or_else(|| FlowError::Decode("outflow overflow".to_string()))?;
        if book.record_unix(symbol, ts, Direction::Outflow, to_decimal(total, NATIVE_DECIMALS)?) {
            merged += 1;
        }
    }
    Ok(merged)
}

/// 20-byte address left-padded to a 32-byte word (`0x000..0<addr>`), lower-case.
pub fn pad_address(address: &str) -> Result<String, FlowError> {
    let body = address.trim().trim_start_matches("0x").trim_start_matches("0X");
    match hex::decode(body) {
        Ok(bytes) if bytes.len() == 20 => Ok(format!("0x{:0>64}", hex::encode(bytes))),
        _ => Err(FlowError::Decode(format!("not an EVM address: {address}"))),
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Evm
    }

    fn assets(&self) -> &[Asset] {
        &self.assets
    }

    async fn balance(&self, address: &str, asset: &Asset, ctx: &ScanContext) -> Result<Holding, FlowError> {
        match &asset.kind {
            AssetKind::Native => self.compute_balance(address, ctx).await,
            AssetKind::Token { contract } => {
                self.compute_erc20_balance(contract, address, &asset.symbol, ctx)
                    .await
            }
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
        match &asset.kind {
            AssetKind::Native => {
                self.compute_native_flows(address, &asset.symbol, window, book, ctx)
                    .await
            }
            AssetKind::Token { contract } => {
                self.compute_erc20_flows(contract, address, &asset.symbol, window, book, ctx)
                    .await
            }
        }
    }
}
