//! Numeric Normalizer
//!
//! Converts hex-encoded quantities (block numbers, log indices, token amounts)
//! into canonical JSON numbers.
//! Quantities are parsed as 256-bit unsigned integers, the EVM word size.

use std::str::FromStr;

use alloy::primitives::U256;
use serde_json::{Number, Value};
use thiserror::Error;

/// Largest value that survives a round trip through an IEEE-754 double unchanged
pub const MAX_EXACT_INTEGER: u64 = 1 << 53;

/// Errors for a numeric field that cannot be read as a quantity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedNumericField {
    #[error("Empty numeric string")]
    Empty,

    #[error("Invalid hex string: {0:?}")]
    InvalidHex(String),

    #[error("Invalid decimal string: {0:?}")]
    InvalidDecimal(String),

    #[error("Value exceeds 256 bits: {0:?}")]
    Overflow(String),

    #[error("Expected a hex string or non-negative integer, found {0}")]
    UnexpectedType(&'static str),
}

/// How quantities above 2^53 are represented once normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionPolicy {
    /// Nearest double. Loses precision above 2^53.
    #[default]
    Lossy,
    /// Decimal string. Exact, but the stored type differs from smaller values.
    /// Hex input must carry a `0x` prefix; bare digit strings are read as decimal.
    Exact,
}

impl PrecisionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrecisionPolicy::Lossy => "lossy",
            PrecisionPolicy::Exact => "exact",
        }
    }
}

impl FromStr for PrecisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lossy" => Ok(PrecisionPolicy::Lossy),
            "exact" => Ok(PrecisionPolicy::Exact),
            other => Err(format!("unknown precision policy {other:?}, expected lossy or exact")),
        }
    }
}

/// Parse an optional hex string (with or without 0x prefix) into a U256
///
/// # Arguments
/// * `hex` - The hex string, or `None` when the field is absent
///
/// # Returns
/// The parsed value; an absent field is zero
pub fn parse_hex_quantity(hex: Option<&str>) -> Result<U256, MalformedNumericField> {
    let Some(hex) = hex else {
        return Ok(U256::ZERO);
    };

    let digits = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);

    if digits.is_empty() {
        return Err(MalformedNumericField::Empty);
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MalformedNumericField::InvalidHex(hex.to_string()));
    }

    U256::from_str_radix(digits, 16).map_err(|_| MalformedNumericField::Overflow(hex.to_string()))
}

/// Parse a decimal digit string, as written by [`PrecisionPolicy::Exact`]
pub fn parse_decimal_quantity(decimal: &str) -> Result<U256, MalformedNumericField> {
    if decimal.is_empty() {
        return Err(MalformedNumericField::Empty);
    }
    if !decimal.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MalformedNumericField::InvalidDecimal(decimal.to_string()));
    }

    U256::from_str_radix(decimal, 10).map_err(|_| MalformedNumericField::Overflow(decimal.to_string()))
}

fn has_hex_prefix(s: &str) -> bool {
    s.starts_with("0x") || s.starts_with("0X")
}

/// Convert a parsed quantity into its stored JSON form
pub fn to_canonical(value: U256, policy: PrecisionPolicy) -> Value {
    if let Some(small) = u64::try_from(value).ok().filter(|v| *v <= MAX_EXACT_INTEGER) {
        return Value::from(small);
    }

    match policy {
        PrecisionPolicy::Lossy => {
            // Decimal parsing rounds to nearest; U256::MAX is well inside f64 range.
            let approx: f64 = value.to_string().parse().unwrap_or(f64::MAX);
            Number::from_f64(approx).map(Value::Number).unwrap_or(Value::Null)
        }
        PrecisionPolicy::Exact => Value::String(value.to_string()),
    }
}

/// Normalize an optional hex string straight to its canonical JSON form
pub fn normalize_hex(hex: Option<&str>, policy: PrecisionPolicy) -> Result<Value, MalformedNumericField> {
    parse_hex_quantity(hex).map(|v| to_canonical(v, policy))
}

/// Field-level normalizer applied to raw JSON values
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: PrecisionPolicy,
}

impl Normalizer {
    pub fn new(policy: PrecisionPolicy) -> Self {
        Self { policy }
    }

    /// Normalize one raw field value
    ///
    /// Absent and `null` fields are zero. Strings are parsed as hex, except
    /// that under `Exact` a string without `0x` is a decimal written by an
    /// earlier pass. Non-negative integral numbers are re-canonicalized, so
    /// output from either policy normalizes to itself.
    pub fn normalize(&self, field: Option<&Value>) -> Result<Value, MalformedNumericField> {
        let quantity = match field {
            None | Some(Value::Null) => U256::ZERO,
            Some(Value::String(s)) if self.policy == PrecisionPolicy::Exact && !has_hex_prefix(s) => {
                parse_decimal_quantity(s)?
            }
            Some(Value::String(s)) => parse_hex_quantity(Some(s))?,
            Some(value @ Value::Number(n)) => match number_quantity(n) {
                Some(quantity) => quantity?,
                None => return Err(MalformedNumericField::UnexpectedType(json_type_name(value))),
            },
            Some(other) => return Err(MalformedNumericField::UnexpectedType(json_type_name(other))),
        };
        Ok(to_canonical(quantity, self.policy))
    }
}

/// Exact value of a non-negative integral JSON number
///
/// `None` for negative or fractional numbers.
fn number_quantity(n: &Number) -> Option<Result<U256, MalformedNumericField>> {
    if let Some(u) = n.as_u64() {
        return Some(Ok(U256::from(u)));
    }
    let f = n.as_f64().filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)?;
    // `{:.0}` prints the double's exact integral value; abs folds -0.0 into 0
    let decimal = format!("{:.0}", f.abs());
    Some(
        U256::from_str_radix(&decimal, 10).map_err(|_| MalformedNumericField::Overflow(n.to_string())),
    )
}

/// Human-readable JSON type name for error messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
