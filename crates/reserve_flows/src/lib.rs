//! reserve_flows: multi-chain balances and fund flows for proof-of-reserve audits.
//!
//! Computes balance snapshots and weekly/daily inflow/outflow per entity, asset and
//! window from public Bitcoin, EVM, Solana and Tron endpoints. Read-only; no keys.

pub mod chains;
pub mod config;
pub mod flow;
pub mod net;
pub mod scan;

pub use chains::{Asset, AssetKind, ChainAdapter, ChainKind, ChainRegistry, FlowError, Holding};
pub use config::{ConfigError, ScanConfig};
pub use flow::{AssetFlow, Direction, FlowBook, FlowBuckets, Granularity, Window};
pub use net::{HttpTransport, RequestClient, RequestError, Transport, TransportError};
pub use scan::{AddressRow, EntityReport, Orchestrator, ScanContext, ScanFailure};
