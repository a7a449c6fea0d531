//! Entity × address × asset orchestration over the chain registry.

mod context;
mod orchestrator;

pub use context::ScanContext;
pub use orchestrator::{AddressRow, EntityReport, Operation, Orchestrator, ScanFailure};
