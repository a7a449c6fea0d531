//! Walks entity × address × asset, dispatching each row to its chain adapter.
//!
//! Rows are processed one at a time. A failure is logged, recorded against the entity and
//! skipped; cancellation or an expired deadline stops the walk and returns what was gathered.

use crate::chains::{ChainRegistry, FlowError, Holding};
use crate::flow::{FlowBook, Window};
use crate::scan::ScanContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::UtcOffset;
use tracing::{debug, info, warn};

/// One monitored address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRow {
    pub entity: String,
    pub chain: String,
    pub address: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Resolve,
    Balance,
    Flows,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanFailure {
    pub entity: String,
    pub chain: String,
    pub address: String,
    /// `None` when the whole row failed (e.g. unknown chain).
    pub asset: Option<String>,
    pub operation: Operation,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct EntityReport {
    pub entity: String,
    /// Summed across the entity's addresses per (chain, symbol).
    pub holdings: Vec<Holding>,
    #[serde(skip_serializing_if = "FlowBook::is_empty")]
    pub book: FlowBook,
    pub failures: Vec<ScanFailure>,
}

impl EntityReport {
    pub fn new(entity: impl Into<String>, reporting_offset: UtcOffset) -> Self {
        Self {
            entity: entity.into(),
            holdings: Vec::new(),
            book: FlowBook::new(reporting_offset),
            failures: Vec::new(),
        }
    }

    pub fn add_holding(&mut self, holding: Holding) {
        match self
            .holdings
            .iter_mut()
            .find(|h| h.chain == holding.chain && h.symbol == holding.symbol)
        {
            Some(existing) => {
                existing.amount += holding.amount;
                existing.decimals = existing.decimals.max(holding.decimals);
            }
            None => self.holdings.push(holding),
        }
    }

    fn fail(&mut self, row: &AddressRow, asset: Option<&str>, operation: Operation, err: &FlowError) {
        warn!(
            entity = %row.entity,
            chain = %row.chain,
            address = %row.address,
            asset = asset.unwrap_or("-"),
            ?operation,
            error = %err,
            "scan step failed"
        );
        self.failures.push(ScanFailure {
            entity: row.entity.clone(),
            chain: row.chain.clone(),
            address: row.address.clone(),
            asset: asset.map(str::to_string),
            operation,
            message: err.to_string(),
        });
    }
}

fn interrupted(err: &FlowError) -> bool {
    matches!(err, FlowError::Cancelled | FlowError::DeadlineExceeded)
}

struct Plan<'a> {
    balances: bool,
    window: Option<&'a Window>,
    reporting_offset: UtcOffset,
}

pub struct Orchestrator {
    registry: ChainRegistry,
}

impl Orchestrator {
    pub fn new(registry: ChainRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    /// Current balances of every configured asset at every row.
    pub async fn snapshot(&self, rows: &[AddressRow], ctx: &ScanContext) -> Vec<EntityReport> {
        let plan = Plan {
            balances: true,
            window: None,
            reporting_offset: UtcOffset::UTC,
        };
        self.run(rows, &plan, ctx).await
    }

    /// Weekly and daily flows within `window`; daily keys use `reporting_offset`.
    pub async fn flows(
        &self,
        rows: &[AddressRow],
        window: &Window,
        reporting_offset: UtcOffset,
        ctx: &ScanContext,
    ) -> Vec<EntityReport> {
        let plan = Plan {
            balances: false,
            window: Some(window),
            reporting_offset,
        };
        self.run(rows, &plan, ctx).await
    }

    /// Balances and flows in one pass.
    pub async fn scan(
        &self,
        rows: &[AddressRow],
        window: &Window,
        reporting_offset: UtcOffset,
        ctx: &ScanContext,
    ) -> Vec<EntityReport> {
        let plan = Plan {
            balances: true,
            window: Some(window),
            reporting_offset,
        };
        self.run(rows, &plan, ctx).await
    }

    async fn run(&self, rows: &[AddressRow], plan: &Plan<'_>, ctx: &ScanContext) -> Vec<EntityReport> {
        let mut reports: BTreeMap<String, EntityReport> = BTreeMap::new();
        'rows: for row in rows {
            let report = reports
                .entry(row.entity.clone())
                .or_insert_with(|| EntityReport::new(&row.entity, plan.reporting_offset));
            if let Err(e) = ctx.check() {
                report.fail(row, None, Operation::Resolve, &e);
                break;
            }
            let adapter = match self.registry.get(&row.chain) {
                Ok(a) => a,
                Err(e) => {
                    report.fail(row, None, Operation::Resolve, &e);
                    continue;
                }
            };

            if plan.balances {
                for (symbol, res) in adapter.balances(&row.address, ctx).await {
                    match res {
                        Ok(holding) => report.add_holding(holding),
                        Err(e) => {
                            report.fail(row, Some(symbol.as_str()), Operation::Balance, &e);
                            if interrupted(&e) {
                                break 'rows;
                            }
                        }
                    }
                }
            }

            if let Some(window) = plan.window {
                for asset in adapter.assets() {
                    match adapter
                        .flows(&row.address, asset, window, &mut report.book, ctx)
                        .await
                    {
                        Ok(merged) => {
                            debug!(entity = %row.entity, chain = %row.chain, symbol = %asset.symbol, merged, "flows merged");
                        }
                        Err(e) => {
                            report.fail(row, Some(asset.symbol.as_str()), Operation::Flows, &e);
                            if interrupted(&e) {
                                break 'rows;
                            }
                        }
                    }
                }
            }
        }

        for r in reports.values() {
            info!(
                entity = %r.entity,
                holdings = r.holdings.len(),
                failures = r.failures.len(),
                "entity scanned"
            );
        }
        reports.into_values().collect()
    }
}
