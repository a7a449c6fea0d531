//! Weekly/daily flow buckets keyed by asset symbol and period.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use time::{OffsetDateTime, UtcOffset};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inflow,
    Outflow,
}

/// One bucket cell. `None` means no flow was observed, which is not the same as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AssetFlow {
    pub inflow: Option<Decimal>,
    pub outflow: Option<Decimal>,
}

impl AssetFlow {
    /// Saturates at `Decimal::MAX` rather than overflowing.
    fn add(&mut self, direction: Direction, amount: Decimal) {
        let slot = match direction {
            Direction::Inflow => &mut self.inflow,
            Direction::Outflow => &mut self.outflow,
        };
        let current = slot.unwrap_or(Decimal::ZERO);
        let sum = current.checked_add(amount).unwrap_or_else(|| {
            warn!(?direction, %current, %amount, "flow total overflowed, saturating");
            Decimal::MAX
        });
        *slot = Some(sum);
    }

    fn absorb(&mut self, other: &AssetFlow) {
        if let Some(v) = other.inflow {
            self.add(Direction::Inflow, v);
        }
        if let Some(v) = other.outflow {
            self.add(Direction::Outflow, v);
        }
    }

    /// Inflow minus outflow, absent fields counted as zero.
    pub fn net(&self) -> Decimal {
        self.inflow.unwrap_or(Decimal::ZERO) - self.outflow.unwrap_or(Decimal::ZERO)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// ISO week (`2024-W10`), UTC.
    Weekly,
    /// Calendar day (`2024-03-04`) in the reporting offset.
    Daily,
}

/// `symbol -> bucket key -> AssetFlow`. Not synchronized; parallel workers each own one
/// and [`FlowBuckets::merge`] afterwards.
#[derive(Clone, Debug, Serialize)]
pub struct FlowBuckets {
    pub granularity: Granularity,
    #[serde(skip)]
    offset: UtcOffset,
    pub cells: BTreeMap<String, BTreeMap<String, AssetFlow>>,
}

impl FlowBuckets {
    pub fn new(granularity: Granularity, offset: UtcOffset) -> Self {
        Self {
            granularity,
            offset,
            cells: BTreeMap::new(),
        }
    }

    pub fn bucket_key(&self, at: OffsetDateTime) -> String {
        match self.granularity {
            Granularity::Weekly => {
                let (year, week, _) = at.to_offset(UtcOffset::UTC).to_iso_week_date();
                format!("{year}-W{week:02}")
            }
            Granularity::Daily => {
                let d = at.to_offset(self.offset).date();
                format!("{:04}-{:02}-{:02}", d.year(), u8::from(d.month()), d.day())
            }
        }
    }

    /// Add a non-negative `amount` to the cell for `symbol` at `at`.
    pub fn add(&mut self, symbol: &str, at: OffsetDateTime, direction: Direction, amount: Decimal) {
        debug_assert!(!amount.is_sign_negative() || amount.is_zero());
        let key = self.bucket_key(at);
        self.cells
            .entry(symbol.to_string())
            .or_default()
            .entry(key)
            .or_default()
            .add(direction, amount.abs());
    }

    pub fn get(&self, symbol: &str, key: &str) -> Option<&AssetFlow> {
        self.cells.get(symbol).and_then(|m| m.get(key))
    }

    /// Per-symbol sum over all bucket keys.
    pub fn totals(&self) -> BTreeMap<String, AssetFlow> {
        self.cells
            .iter()
            .map(|(symbol, keys)| {
                let mut total = AssetFlow::default();
                for cell in keys.values() {
                    total.absorb(cell);
                }
                (symbol.clone(), total)
            })
            .collect()
    }

    pub fn merge(&mut self, other: &FlowBuckets) {
        for (symbol, keys) in &other.cells {
            let mine = self.cells.entry(symbol.clone()).or_default();
            for (key, cell) in keys {
                mine.entry(key.clone()).or_default().absorb(cell);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Weekly and daily buckets fed together; what adapters write into.
#[derive(Clone, Debug, Serialize)]
pub struct FlowBook {
    pub weekly: FlowBuckets,
    pub daily: FlowBuckets,
}

impl FlowBook {
    pub fn new(reporting_offset: UtcOffset) -> Self {
        Self {
            weekly: FlowBuckets::new(Granularity::Weekly, reporting_offset),
            daily: FlowBuckets::new(Granularity::Daily, reporting_offset),
        }
    }

    pub fn record(&mut self, symbol: &str, at: OffsetDateTime, direction: Direction, amount: Decimal) {
        self.weekly.add(symbol, at, direction, amount);
        self.daily.add(symbol, at, direction, amount);
    }

    /// Positive deltas are inflow, negative are outflow, zero is ignored.
    pub fn record_signed(&mut self, symbol: &str, at: OffsetDateTime, delta: Decimal) {
        if delta.is_zero() {
            return;
        }
        let direction = if delta.is_sign_negative() {
            Direction::Outflow
        } else {
            Direction::Inflow
        };
        self.record(symbol, at, direction, delta.abs());
    }

    /// Record at a unix-second timestamp. Returns false (and records nothing) when the
    /// timestamp is out of range.
    pub fn record_unix(&mut self, symbol: &str, ts: i64, direction: Direction, amount: Decimal) -> bool {
        match OffsetDateTime::from_unix_timestamp(ts) {
            Ok(at) => {
                self.record(symbol, at, direction, amount);
                true
            }
            Err(_) => false,
        }
    }

    pub fn merge(&mut self, other: &FlowBook) {
        self.weekly.merge(&other.weekly);
        self.daily.merge(&other.daily);
    }

    pub fn is_empty(&self) -> bool {
        self.weekly.is_empty() && self.daily.is_empty()
    }
}
