//! Bitcoin adapter against scripted Esplora responses.

mod common;

use common::*;
use reserve_flows::chains::BitcoinAdapter;
use reserve_flows::net::{PagingError, PagingLimits};
use reserve_flows::{FlowBook, FlowError, ScanContext};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use time::UtcOffset;

const ADDR: &str = "bc1qreserve";

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn adapter(transport: &std::sync::Arc<MockTransport>, bases: &[&str]) -> BitcoinAdapter {
    BitcoinAdapter::new(
        "btc",
        client(transport),
        bases.iter().map(|b| b.to_string()).collect(),
        "BTC",
    )
    .with_backoff(instant_backoff())
}

#[tokio::test]
async fn week_of_deposits_and_one_withdrawal() {
    let t = MockTransport::new();
    t.on(url_ends("/address/bc1qreserve/txs/chain"), vec![ok(fixture("esplora_txs_week10.json"))]);
    let mut book = FlowBook::new(UtcOffset::UTC);
    let merged = adapter(&t, &["https://a.test/api"])
        .compute_flows(ADDR, "BTC", &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap();

    assert_eq!(merged, 3);
    let week = book.weekly.get("BTC", "2024-W10").unwrap();
    assert_eq!(week.inflow, Some(dec("0.8")));
    assert_eq!(week.outflow, Some(dec("0.2")));
    assert_eq!(book.daily.get("BTC", "2024-03-04").unwrap().inflow, Some(dec("0.5")));
    assert_eq!(book.daily.get("BTC", "2024-03-05").unwrap().inflow, Some(dec("0.3")));
    assert_eq!(book.daily.get("BTC", "2024-03-06").unwrap().inflow, None);
    assert_eq!(book.daily.get("BTC", "2024-03-06").unwrap().outflow, Some(dec("0.2")));
    // short page with an older tx ends paging after one request
    assert_eq!(t.calls().len(), 1);
}

#[tokio::test]
async fn history_fails_over_to_second_provider() {
    let t = MockTransport::new();
    t.on(url_has("https://a.test/"), vec![status(500, "upstream down")]);
    t.on(url_has("https://b.test/"), vec![ok(fixture("esplora_txs_week10.json"))]);
    let mut book = FlowBook::new(UtcOffset::UTC);
    adapter(&t, &["https://a.test/api", "https://b.test/api/"])
        .compute_flows(ADDR, "BTC", &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap();

    let urls = t.urls();
    assert_eq!(urls.len(), 2);
    assert!(urls[0].starts_with("https://a.test/api/address/"));
    assert_eq!(urls[1], "https://b.test/api/address/bc1qreserve/txs/chain");
    assert_eq!(book.weekly.totals()["BTC"].inflow, Some(dec("0.8")));
}

#[tokio::test]
async fn gives_up_after_consecutive_errors() {
    let t = MockTransport::new();
    t.on(url_has("/txs/chain"), vec![status(503, "busy")]);
    let mut book = FlowBook::new(UtcOffset::UTC);
    let err = adapter(&t, &["https://a.test/api", "https://b.test/api"])
        .with_limits(PagingLimits {
            max_consecutive_errors: 3,
            ..PagingLimits::default()
        })
        .compute_flows(ADDR, "BTC", &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(t.calls().len(), 3);
    assert!(book.is_empty());
}

#[tokio::test]
async fn repeated_cursor_is_reported_as_stuck() {
    // A full page that the provider keeps returning no matter the cursor.
    let page: Vec<_> = (0..25)
        .map(|i| {
            json!({
                "txid": format!("tx{i:02}"),
                "vin": [],
                "vout": [{"scriptpubkey_address": ADDR, "value": 1000}],
                "status": {"confirmed": true, "block_time": 1_709_600_000 - i}
            })
        })
        .collect();
    let t = MockTransport::new();
    t.on(url_has("/txs/chain"), vec![ok_json(&json!(page))]);
    let mut book = FlowBook::new(UtcOffset::UTC);
    let err = adapter(&t, &["https://a.test/api"])
        .compute_flows(ADDR, "BTC", &week10(), &mut book, &ScanContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Paging(PagingError::Stuck { .. })));
    // the first page was merged once; repeats are not double counted
    assert_eq!(book.weekly.totals()["BTC"].inflow, Some(dec("0.00025")));
    assert_eq!(t.urls()[1], "https://a.test/api/address/bc1qreserve/txs/chain/tx24");
}

#[tokio::test]
async fn balance_uses_first_provider_that_answers() {
    let t = MockTransport::new();
    t.on(url_has("https://a.test/"), vec![status(502, "bad gateway")]);
    t.on(url_has("https://b.test/"), vec![ok(fixture("esplora_address.json"))]);
    let holding = adapter(&t, &["https://a.test/api", "https://b.test/api"])
        .compute_balance(ADDR, &ScanContext::new())
        .await
        .unwrap();
    assert_eq!(holding.amount, dec("0.75"));
    assert_eq!(holding.decimals, 8);
    assert_eq!(holding.symbol, "BTC");
}

#[tokio::test]
async fn balance_fails_only_when_every_provider_fails() {
    let t = MockTransport::new();
    t.on(url_has("/address/"), vec![status(500, "nope")]);
    let err = adapter(&t, &["https://a.test/api", "https://b.test/api"])
        .compute_balance(ADDR, &ScanContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::AllProvidersFailed { providers: 2, .. }));
}

#[tokio::test]
async fn cancelled_scan_makes_no_requests() {
    let t = MockTransport::new();
    t.on(url_has("/txs/chain"), vec![ok(fixture("esplora_txs_week10.json"))]);
    let ctx = ScanContext::new();
    ctx.cancel_token().cancel();
    let mut book = FlowBook::new(UtcOffset::UTC);
    let err = adapter(&t, &["https://a.test/api"])
        .compute_flows(ADDR, "BTC", &week10(), &mut book, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Cancelled));
    assert!(t.calls().is_empty());
}
