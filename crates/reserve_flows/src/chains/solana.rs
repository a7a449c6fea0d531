//! Solana over JSON-RPC: lamport and SPL balances, flows from pre/post balances of each
//! transaction in the owner's signature history.

use crate::chains::{unsupported, Asset, AssetKind, ChainAdapter, ChainKind, FlowError, Holding};
use crate::flow::{parse_decimal_quantity, to_decimal, Direction, FlowBook, Window};
use crate::net::{PageGuard, PagingLimits, RequestClient};
use crate::scan::ScanContext;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

pub const LAMPORT_DECIMALS: u32 = 9;
/// Exponent assumed when a token balance entry omits `decimals`.
pub const DEFAULT_SPL_DECIMALS: u32 = 6;
const SIGNATURE_PAGE_LIMIT: usize = 1000;

#[derive(Deserialize)]
struct RpcValue<T> {
    value: T,
}

#[derive(Deserialize)]
struct TokenAccount {
    account: TokenAccountData,
}

#[derive(Deserialize)]
struct TokenAccountData {
    data: ParsedData,
}

#[derive(Deserialize)]
struct ParsedData {
    parsed: ParsedAccount,
}

#[derive(Deserialize)]
struct ParsedAccount {
    info: ParsedTokenInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParsedTokenInfo {
    token_amount: UiTokenAmount,
}

#[derive(Deserialize)]
struct UiTokenAmount {
    amount: String,
    #[serde(default)]
    decimals: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    pub block_time: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolTransaction {
    block_time: Option<i64>,
    meta: Option<TxMeta>,
    transaction: TxEnvelope,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxMeta {
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
    #[serde(default)]
    pre_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    post_token_balances: Option<Vec<TokenBalance>>,
    #[serde(default)]
    loaded_addresses: Option<LoadedAddresses>,
}

#[derive(Deserialize, Default)]
struct LoadedAddresses {
    #[serde(default)]
    writable: Vec<String>,
    #[serde(default)]
    readonly: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBalance {
    mint: String,
    owner: Option<String>,
    ui_token_amount: UiTokenAmount,
}

#[derive(Deserialize)]
struct TxEnvelope {
    message: TxMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxMessage {
    account_keys: Vec<String>,
}

/// What a flow scan measures in each transaction.
enum Target<'a> {
    Native,
    Token { mint: &'a str, fallback_decimals: u32 },
}

pub struct SolanaAdapter {
    id: String,
    client: RequestClient,
    rpc_url: String,
    assets: Vec<Asset>,
    limits: PagingLimits,
}

impl SolanaAdapter {
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
            assets: vec![Asset::native(native_symbol, LAMPORT_DECIMALS)],
            limits: PagingLimits::default(),
        }
    }

    pub fn with_token(mut self, symbol: impl Into<String>, mint: impl Into<String>, decimals: Option<u32>) -> Self {
        self.assets.push(Asset::token(symbol, mint, decimals));
        self
    }

    pub fn with_limits(mut self, limits: PagingLimits) -> Self {
        self.limits = limits;
        self
    }

    pub async fn compute_balance(&self, owner: &str, ctx: &ScanContext) -> Result<Holding, FlowError> {
        let lamports: RpcValue<u64> = ctx
            .guard(self.client.rpc(&self.rpc_url, "getBalance", json!([owner])))
            .await?;
        Ok(Holding {
            chain: self.id.clone(),
            symbol: self.assets[0].symbol.clone(),
            amount: to_decimal(u128::from(lamports.value), LAMPORT_DECIMALS)?,
            decimals: LAMPORT_DECIMALS,
        })
    }

    /// Sum of every token account `owner` holds for `mint`.
    pub async fn compute_token_balance(
        &self,
        owner: &str,
        mint: &str,
        symbol: &str,
        fallback_decimals: Option<u32>,
        ctx: &ScanContext,
    ) -> Result<Holding, FlowError> {
        let accounts: RpcValue<Vec<TokenAccount>> = ctx
            .guard(self.client.rpc(
                &self.rpc_url,
                "getTokenAccountsByOwner",
                json!([owner, { "mint": mint }, { "encoding": "jsonParsed" }]),
            ))
            .await?;
        let mut raw: u128 = 0;
        let mut decimals = None;
        for acct in &accounts.value {
            let amount = &acct.account.data.parsed.info.token_amount;
            raw = raw
                .checked_add(parse_decimal_quantity(&amount.amount)?)
                .ok_or_else(|| FlowError::Decode(format!("{mint} balance overflow")))?;
            decimals = decimals.or(amount.decimals);
        }
        let decimals = decimals
            .or(fallback_decimals)
            .unwrap_or(DEFAULT_SPL_DECIMALS);
        Ok(Holding {
            chain: self.id.clone(),
            symbol: symbol.to_string(),
            amount: to_decimal(raw, decimals)?,
            decimals,
        })
    }

    /// Signatures newest-first down to `start`. The page holding the first older entry is
    /// still scanned for entries at or after `start`.
    pub async fn list_signatures_since(
        &self,
        owner: &str,
        start_unix: i64,
        ctx: &ScanContext,
    ) -> Result<Vec<SignatureInfo>, FlowError> {
        let mut guard = PageGuard::new(self.limits.clone());
        let mut out = Vec::new();
        loop {
            let mut opts = json!({ "limit": SIGNATURE_PAGE_LIMIT });
            if let Some(before) = guard.cursor() {
                opts["before"] = json!(before);
            }
            let page: Vec<SignatureInfo> = ctx
                .guard(self.client.rpc(&self.rpc_url, "getSignaturesForAddress", json!([owner, opts])))
                .await?;
            guard.record_page()?;
            let full = page.len() >= SIGNATURE_PAGE_LIMIT;
            let last = page.last().map(|s| s.signature.clone());
            let mut older_seen = false;
            for sig in page {
                match sig.block_time {
                    Some(t) if t < start_unix => older_seen = true,
                    _ => out.push(sig),
                }
            }
            match last {
                Some(last) if full && !older_seen => {
                    guard.advance(&last)?;
                }
                _ => break,
            }
        }
        debug!(chain = %self.id, count = out.len(), pages = guard.pages(), "signatures");
        Ok(out)
    }

    async fn fetch_transaction(&self, signature: &str, ctx: &ScanContext) -> Result<Option<SolTransaction>, FlowError> {
        let res = ctx
            .guard(self.client.rpc(
                &self.rpc_url,
                "getTransaction",
                json!([signature, { "encoding": "json", "maxSupportedTransactionVersion": 0 }]),
            ))
            .await;
        match res {
            Ok(tx) => Ok(tx),
            Err(e @ (FlowError::Cancelled | FlowError::DeadlineExceeded)) => Err(e),
            Err(e) => {
                warn!(chain = %self.id, signature, error = %e, "transaction fetch failed, skipping");
                Ok(None)
            }
        }
    }

    async fn scan_flows(
        &self,
        owner: &str,
        symbol: &str,
        target: Target<'_>,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError> {
        let signatures = self.list_signatures_since(owner, window.start_unix(), ctx).await?;
        let mut merged = 0usize;
        let mut skipped = 0usize;
        for sig in &signatures {
            if sig.block_time.is_some_and(|t| !window.contains_unix(t)) {
                continue;
            }
            ctx.check()?;
            let Some(tx) = self.fetch_transaction(&sig.signature, ctx).await? else {
                skipped += 1;
                continue;
            };
            let Some(ts) = tx.block_time.filter(|t| window.contains_unix(*t)) else {
                continue;
            };
            let Some(meta) = &tx.meta else {
                continue;
            };
            let (delta, decimals) = match &target {
                Target::Native => (native_delta(&tx, meta, owner), LAMPORT_DECIMALS),
                Target::Token {
                    mint,
                    fallback_decimals,
                } => token_delta(meta, owner, mint, *fallback_decimals)?,
            };
            if delta == 0 {
                continue;
            }
            let direction = if delta > 0 {
                Direction::Inflow
            } else {
                Direction::Outflow
            };
            let amount = to_decimal(delta.unsigned_abs(), decimals)?;
            if book.record_unix(symbol, ts, direction, amount) {
                merged += 1;
            }
        }
        info!(chain = %self.id, symbol, signatures = signatures.len(), merged, skipped, "solana flows");
        Ok(merged)
    }

    pub async fn compute_native_flows(
        &self,
        owner: &str,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError> {
        let symbol = self.assets[0].symbol.clone();
        self.scan_flows(owner, &symbol, Target::Native, window, book, ctx)
            .await
    }

    /// Flows of the SPL token `asset` (its contract is the mint).
    pub async fn compute_token_flows(
        &self,
        owner: &str,
        asset: &Asset,
        window: &Window,
        book: &mut FlowBook,
        ctx: &ScanContext,
    ) -> Result<usize, FlowError> {
        let Some(mint) = asset.contract() else {
            return Err(unsupported(&self.id, asset, "not an SPL token"));
        };
        let target = Target::Token {
            mint,
            fallback_decimals: asset.decimals.unwrap_or(DEFAULT_SPL_DECIMALS),
        };
        self.scan_flows(owner, &asset.symbol, target, window, book, ctx)
            .await
    }
}

/// Post minus pre lamports at the owner's account index; zero if the owner is absent.
fn native_delta(tx: &SolTransaction, meta: &TxMeta, owner: &str) -> i128 {
    let loaded = meta.loaded_addresses.as_ref();
    let keys = tx
        .transaction
        .message
        .account_keys
        .iter()
        .chain(loaded.into_iter().flat_map(|l| l.writable.iter()))
        .chain(loaded.into_iter().flat_map(|l| l.readonly.iter()));
    let Some(idx) = keys.into_iter().position(|k| k == owner) else {
        return 0;
    };
    match (meta.pre_balances.get(idx), meta.post_balances.get(idx)) {
        (Some(pre), Some(post)) => i128::from(*post) - i128::from(*pre),
        _ => 0,
    }
}

/// Post minus pre token amount over entries owned by `owner` for `mint`, with the
/// exponent the ledger reports.
fn token_delta(meta: &TxMeta, owner: &str, mint: &str, fallback_decimals: u32) -> Result<(i128, u32), FlowError> {
    let matching = |entries: &Option<Vec<TokenBalance>>| -> Result<(i128, Option<u32>), FlowError> {
        let mut sum = 0i128;
        let mut decimals = None;
        for e in entries.iter().flatten() {
            let owned = e.owner.as_deref().is_some_and(|o| o.eq_ignore_ascii_case(owner));
            if !owned || !e.mint.eq_ignore_ascii_case(mint) {
                continue;
            }
            let raw = parse_decimal_quantity(&e.ui_token_amount.amount)?;
            sum += i128::try_from(raw).map_err(|_| FlowError::Decode(format!("{mint} amount overflow")))?;
            decimals = decimals.or(e.ui_token_amount.decimals);
        }
        Ok((sum, decimals))
    };
    let (pre, pre_dec) = matching(&meta.pre_token_balances)?;
    let (post, post_dec) = matching(&meta.post_token_balances)?;
    let decimals = post_dec.or(pre_dec).unwrap_or(fallback_decimals);
    Ok((post - pre, decimals))
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Solana
    }

    fn assets(&self) -> &[Asset] {
        &self.assets
    }

    async fn balance(&self, address: &str, asset: &Asset, ctx: &ScanContext) -> Result<Holding, FlowError> {
        match &asset.kind {
            AssetKind::Native => self.compute_balance(address, ctx).await,
            AssetKind::Token { contract } => {
                self.compute_token_balance(address, contract, &asset.symbol, asset.decimals, ctx)
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
            AssetKind::Native if asset.symbol == self.assets[0].symbol => {
                self.compute_native_flows(address, window, book, ctx).await
            }
            AssetKind::Native => Err(unsupported(&self.id, asset, "unknown native symbol")),
            AssetKind::Token { .. } => {
                self.compute_token_flows(address, asset, window, book, ctx)
                    .await
            }
        }
    }
}
