//! `0x`-prefixed hexadecimal quantities at the collaborator boundary.
//!
//! Every gas, nonce and value field is carried as a hex string and converted
//! to `U256` for arithmetic. Conversions round-trip exactly for any value
//! that fits in 256 bits.

use ethers::types::U256;

use crate::error::TxError;

pub fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

pub fn add_hex_prefix(value: &str) -> String {
    format!("0x{}", strip_hex_prefix(value))
}

/// Parses a quantity, with or without prefix. An empty body (`"0x"`) is zero.
pub fn parse_quantity(field: &str, value: &str) -> Result<U256, TxError> {
    let trimmed = value.trim();
    if trimmed.starts_with('-') {
        return Err(TxError::InvalidParams(format!(
            "{} must be non-negative, got {}",
            field, value
        )));
    }

    let digits = strip_hex_prefix(trimmed);
    if digits.is_empty() {
        return Ok(U256::zero());
    }

    U256::from_str_radix(digits, 16)
        .map_err(|e| TxError::InvalidParams(format!("{} is not a hex quantity ({}): {}", field, value, e)))
}

pub fn parse_optional_quantity(field: &str, value: Option<&str>) -> Result<Option<U256>, TxError> {
    value.map(|v| parse_quantity(field, v)).transpose()
}

/// Quantities returned by a node that fail to parse are a node fault, not a
/// caller fault.
pub fn parse_chain_quantity(field: &str, value: &str) -> Result<U256, TxError> {
    parse_quantity(field, value).map_err(|e| TxError::ChainQuery(e.to_string()))
}

pub fn to_quantity(value: U256) -> String {
    format!("0x{:x}", value)
}
