//! Solana adapter against a scripted JSON-RPC node.

mod common;

use common::*;
use reserve_flows::chains::SolanaAdapter;
use reserve_flows::net::HttpRequest;
use reserve_flows::{Asset, FlowBook, ScanContext};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use time::UtcOffset;

const OWNER: &str = "ReserveOwner1111111111111111111111111111111";
const MINT: &str = "MintUSDC111111111111111111111111111111111111";

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Three signatures: a deposit, one whose fetch fails, one older than the window.
fn node(t: &Arc<MockTransport>, failing: Reply) {
    t.on(
        rpc_method("getSignaturesForAddress"),
        vec![rpc_result(json!([
            {"signature": "sigDeposit", "slot": 3, "blockTime": 1709600000, "err": null},
            {"signature": "sigBroken", "slot": 2, "blockTime": 1709550000, "err": null},
            {"signature": "sigOld", "slot": 1, "blockTime": 1709000000, "err": null}
        ]))],
    );
    let deposit = fixture_json("solana_tx_deposit.json");
    t.on_fn(rpc_method("getTransaction"), move |r: &HttpRequest| match params(r)[0].as_str() {
        Some("sigDeposit") => rpc_result(deposit.clone()),
        _ => failing.clone(),
    });
}

fn adapter(t: &Arc<MockTransport>) -> SolanaAdapter {
    SolanaAdapter::new("sol", client(t), "https://solana.test", "SOL").with_token("USDC", MINT, None)
}

#[tokio::test]
async fn lamport_flows_skip_failed_fetches() {
    let t = MockTransport::new();
    node(&t, rpc_error(-32009, "transaction unavailable"));
    let mut book = FlowBook::new(UtcOffset::UTC);
    let merged = adapter(&t)
        .compute_native_flows(OWNER, &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap();

    assert_eq!(merged, 1);
    let day = book.daily.get("SOL", "2024-03-05").unwrap();
    assert_eq!(day.inflow, Some(Decimal::ONE));
    assert_eq!(day.outflow, None);
    // the old signature is never fetched
    let fetched: Vec<String> = t
        .calls()
        .iter()
        .filter(|c| c.body.as_ref().is_some_and(|b| b["method"] == "getTransaction"))
        .map(|c| params(c)[0].as_str().unwrap().to_string())
        .collect();
    assert_eq!(fetched, vec!["sigDeposit", "sigBroken"]);
}

#[tokio::test]
async fn null_transaction_is_skipped() {
    let t = MockTransport::new();
    node(&t, rpc_result(json!(null)));
    let mut book = FlowBook::new(UtcOffset::UTC);
    let merged = adapter(&t)
        .compute_native_flows(OWNER, &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap();
    assert_eq!(merged, 1);
}

#[tokio::test]
async fn spl_flows_use_owner_and_mint() {
    let t = MockTransport::new();
    node(&t, rpc_result(json!(null)));
    let sol = adapter(&t);
    let usdc = Asset::token("USDC", MINT, None);
    let mut book = FlowBook::new(UtcOffset::UTC);
    sol.compute_token_flows(OWNER, &usdc, &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap();
    assert_eq!(book.weekly.get("USDC", "2024-W10").unwrap().inflow, Some(dec("2.5")));

    // the payer holds no USDC
    let mut book = FlowBook::new(UtcOffset::UTC);
    let merged = sol
        .compute_token_flows("Payer111111111111111111111111111111111111111", &usdc, &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap();
    assert_eq!(merged, 0);
    assert!(book.is_empty());
}

#[tokio::test]
async fn signature_request_shape() {
    let t = MockTransport::new();
    node(&t, rpc_result(json!(null)));
    let mut book = FlowBook::new(UtcOffset::UTC);
    adapter(&t)
        .compute_native_flows(OWNER, &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap();
    let first = &t.calls()[0];
    let p = params(first);
    assert_eq!(p[0], OWNER);
    assert_eq!(p[1]["limit"], 1000);
    assert!(p[1].get("before").is_none());
    let tx_call = t
        .calls()
        .into_iter()
        .find(|c| c.body.as_ref().is_some_and(|b| b["method"] == "getTransaction"))
        .unwrap();
    assert_eq!(params(&tx_call)[1]["maxSupportedTransactionVersion"], 0);
    assert_eq!(params(&tx_call)[1]["encoding"], "json");
}

#[tokio::test]
async fn balances_sum_token_accounts() {
    let t = MockTransport::new();
    t.on(rpc_method("getBalance"), vec![rpc_result(json!({"context": {"slot": 1}, "value": 2_500_000_000u64}))]);
    let account = |amount: &str| {
        json!({
            "pubkey": "Ata",
            "account": {"data": {"parsed": {"info": {
                "mint": MINT, "owner": OWNER,
                "tokenAmount": {"amount": amount, "decimals": 6, "uiAmountString": "x"}
            }, "type": "account"}, "program": "spl-token"}}
        })
    };
    t.on(
        rpc_method("getTokenAccountsByOwner"),
        vec![rpc_result(json!({"context": {"slot": 1}, "value": [account("1000000"), account("250000")]}))],
    );
    let sol = adapter(&t);
    let holdings = reserve_flows::ChainAdapter::balances(&sol, OWNER, &ScanContext::new()).await;
    assert_eq!(holdings.len(), 2);
    let native = holdings[0].1.as_ref().unwrap();
    assert_eq!(native.amount, dec("2.5"));
    assert_eq!(native.decimals, 9);
    let usdc = holdings[1].1.as_ref().unwrap();
    assert_eq!(usdc.amount, dec("1.25"));
    assert_eq!(usdc.decimals, 6);
}
