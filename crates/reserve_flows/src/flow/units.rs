//! Raw integer ledger amounts <-> exact decimals.

use rust_decimal::Decimal;
use thiserror::Error;

/// Largest exponent `rust_decimal` can represent.
pub const MAX_DECIMALS: u32 = 28;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitsError {
    #[error("decimal exponent {0} exceeds 28")]
    ExponentTooLarge(u32),
    #[error("amount {0} does not fit in a 96-bit decimal mantissa")]
    Overflow(String),
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

/// Convert a raw integer amount into units using the asset's exponent.
pub fn to_decimal(raw: u128, decimals: u32) -> Result<Decimal, UnitsError> {
    if decimals > MAX_DECIMALS {
        return Err(UnitsError::ExponentTooLarge(decimals));
    }
    let mantissa = i128::try_from(raw).map_err(|_| UnitsError::Overflow(raw.to_string()))?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map_err(|_| UnitsError::Overflow(raw.to_string()))
}

/// Inverse of [`to_decimal`]. Returns `None` when `amount` is negative or carries more
/// fractional digits than `decimals` allows.
pub fn to_raw(amount: Decimal, decimals: u32) -> Option<u128> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return None;
    }
    let mut scaled = amount;
    scaled.rescale(decimals);
    if scaled.scale() != decimals || scaled != amount {
        return None;
    }
    u128::try_from(scaled.mantissa()).ok()
}

/// Parse an RPC hex quantity (`0x1a`) or a left-padded 32-byte word.
pub fn parse_hex_quantity(s: &str) -> Result<u128, UnitsError> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches('0');
    if digits.is_empty() {
        return Ok(0);
    }
    if digits.len() > 32 {
        return Err(UnitsError::Overflow(s.to_string()));
    }
    u128::from_str_radix(digits, 16).map_err(|_| UnitsError::InvalidQuantity(s.to_string()))
}

/// Parse a base-10 integer amount as served by REST indexers (`"1500000"`).
pub fn parse_decimal_quantity(s: &str) -> Result<u128, UnitsError> {
    let t = s.trim();
    if t.is_empty() || !t.bytes().all(|b| b.is_ascii_digit()) {
        return Err(UnitsError::InvalidQuantity(s.to_string()));
    }
    t.parse::<u128>()
        .map_err(|_| UnitsError::Overflow(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn six_decimals() {
        let d = to_decimal(1_500_000, 6).unwrap();
        assert_eq!(d, Decimal::from_str("1.5").unwrap());
    }

    #[test]
    fn round_trip_over_exponents() {
        let raws = [0u128, 1, 7, 1_500_000, 99_999_999, 21_000_000 * 100_000_000, 10u128.pow(27)];
        for raw in raws {
            for d in [0u32, 2, 6, 8, 9, 18, 28] {
                let dec = to_decimal(raw, d).unwrap();
                assert_eq!(to_raw(dec, d), Some(raw), "raw {raw} exp {d}");
            }
        }
    }

    #[test]
    fn to_raw_rejects_excess_precision() {
        let d = Decimal::from_str("1.2345").unwrap();
        assert_eq!(to_raw(d, 2), None);
        assert_eq!(to_raw(-d, 4), None);
        assert_eq!(to_raw(d, 4), Some(12345));
    }

    #[test]
    fn exponent_too_large() {
        assert_eq!(to_decimal(1, 30), Err(UnitsError::ExponentTooLarge(30)));
    }

    #[test]
    fn mantissa_overflow() {
        assert!(matches!(to_decimal(u128::MAX, 0), Err(UnitsError::Overflow(_))));
    }

    #[test]
    fn hex_quantities() {
        assert_eq!(parse_hex_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_hex_quantity("0x").unwrap(), 0);
        assert_eq!(parse_hex_quantity("0x1a").unwrap(), 26);
        let word = format!("0x{:0>64}", "16e360");
        assert_eq!(parse_hex_quantity(&word).unwrap(), 1_500_000);
        assert!(parse_hex_quantity("0xzz").is_err());
        let huge = format!("0x1{}", "0".repeat(32));
        assert!(matches!(parse_hex_quantity(&huge), Err(UnitsError::Overflow(_))));
    }

    #[test]
    fn decimal_quantities() {
        assert_eq!(parse_decimal_quantity("1500000").unwrap(), 1_500_000);
        assert!(parse_decimal_quantity("-1").is_err());
        assert!(parse_decimal_quantity("1.5").is_err());
        assert!(parse_decimal_quantity("").is_err());
    }
}
