//! Time windows, decimal unit conversion and the weekly/daily flow accumulator.

mod accumulator;
mod units;
mod window;

pub use accumulator::{AssetFlow, Direction, FlowBook, FlowBuckets, Granularity};
pub use units::{parse_decimal_quantity, parse_hex_quantity, to_decimal, to_raw, UnitsError, MAX_DECIMALS};
pub use window::{Window, WindowError};
