//! Money conversion and scaled arithmetic
//!
//! Unified conversion between the internal `u64` representation and the
//! client-facing string/Decimal representation. All conversions MUST go
//! through this module.
//!
//! ## Internal representation
//! - All amounts are stored as `u64`, scaled by `10^scale`
//! - The authoritative source for scales is the `SymbolRegistry`
//! - Scales never exceed [`MAX_SCALE`] fractional digits
//!
//! ## Design principles
//! 1. Exactness: no floating point anywhere on the money path
//! 2. Explicit error handling: no silent truncation of client input
//! 3. Widened intermediates: `price * qty` goes through `u128`

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use thiserror::Error;

/// Maximum fractional digits any asset or price may carry.
pub const MAX_SCALE: u32 = 10;

/// Represents an unsigned monetary amount scaled by 10^scale.
/// Internal value is private to force construction through audited money logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScaledAmount(u64);

impl ScaledAmount {
    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }
}

impl From<u64> for ScaledAmount {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Deref for ScaledAmount {
    type Target = u64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ScaledAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Money conversion errors
#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Unit amount for a scale: 10^scale as a ScaledAmount.
#[inline]
pub fn unit_amount(scale: u32) -> ScaledAmount {
    ScaledAmount(10u64.pow(scale))
}

/// Converts a decimal string to internal ScaledAmount using provided scale.
///
/// # Errors
/// * `PrecisionOverflow` - input has more decimal places than allowed
/// * `InvalidAmount` - amount is zero or negative
/// * `Overflow` - result would overflow u64
/// * `InvalidFormat` - string format is invalid
///
/// # Example
/// parse_amount("1.5", 8) -> 150_000_000
pub fn parse_amount(amount_str: &str, scale: u32) -> Result<ScaledAmount, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    let parts: Vec<&str> = amount_str.split('.').collect();
    let (whole, frac) = match parts.len() {
        1 => (parts[0], ""),
        2 => {
            // Require both sides of the dot: rejects ".5" and "5."
            if parts[0].is_empty() || parts[1].is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "both sides of the decimal point must be present".into(),
                ));
            }
            if scale == 0 {
                return Err(MoneyError::InvalidFormat(
                    "scale is 0, but dot provided".into(),
                ));
            }
            (parts[0], parts[1])
        }
        _ => return Err(MoneyError::InvalidFormat("multiple decimal points".into())),
    };

    // Precision validation: REJECT if too many decimals (no silent truncation!)
    if frac.len() > scale as usize {
        return Err(MoneyError::PrecisionOverflow {
            provided: frac.len() as u32,
            max: scale,
        });
    }

    let whole_num: u64 = whole
        .parse::<u64>()
        .map_err(|_| MoneyError::InvalidFormat(format!("invalid whole part: {}", whole)))?;

    let frac_num: u64 = if frac.is_empty() {
        0
    } else {
        let frac_padded = format!("{:0<width$}", frac, width = scale as usize);
        frac_padded[..scale as usize]
            .parse::<u64>()
            .map_err(|_| MoneyError::InvalidFormat("invalid fractional part".into()))?
    };

    let amount = whole_num
        .checked_mul(10u64.pow(scale))
        .and_then(|v| v.checked_add(frac_num))
        .ok_or(MoneyError::Overflow)?;

    if amount == 0 {
        return Err(MoneyError::InvalidAmount);
    }

    Ok(ScaledAmount(amount))
}

/// Converts a Decimal to internal ScaledAmount. Checks the scale limit.
///
/// Used at the API boundary where `rust_decimal::Decimal` arrives from
/// JSON deserialization.
pub fn parse_decimal(amount: Decimal, scale: u32) -> Result<ScaledAmount, MoneyError> {
    if amount.scale() > scale {
        return Err(MoneyError::PrecisionOverflow {
            provided: amount.scale(),
            max: scale,
        });
    }
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }
    let scaled = amount * Decimal::from(10u64.pow(scale));
    scaled.to_u64().map(ScaledAmount).ok_or(MoneyError::Overflow)
}

/// Format an internal scaled value as a decimal string.
///
/// `display_scale` truncates to fewer fractional digits than the internal
/// scale for display; it never rounds up.
///
/// # Example
/// format_amount(150_000_000, 8, 4) -> "1.5000"
pub fn format_amount(value: u64, scale: u32, display_scale: u32) -> String {
    let unit = 10u64.pow(scale);
    let whole = value / unit;
    if display_scale == 0 {
        return whole.to_string();
    }
    let frac = value % unit;
    let frac_str = format!("{:0>width$}", frac, width = scale as usize);
    let shown = display_scale.min(scale) as usize;
    let mut out = format!("{}.{}", whole, &frac_str[..shown]);
    // Pad if the display scale exceeds the internal scale
    if (display_scale as usize) > shown {
        out.push_str(&"0".repeat(display_scale as usize - shown));
    }
    out
}

/// Convert a raw scaled value to Decimal for display/arithmetic at the boundary.
#[inline]
pub fn to_decimal(value: u64, scale: u32) -> Decimal {
    Decimal::from(value) / Decimal::from(10u64.pow(scale))
}

/// Quote notional of a fill: `price * qty / 10^base_scale`, truncating.
///
/// `price` is scaled to the quote asset, `qty` to the base asset. The
/// intermediate is widened to `u128`; an explicit error is returned if the
/// result exceeds `u64` (silent wrapping here would under-lock funds).
#[inline]
pub fn quote_notional(price: u64, qty: u64, base_scale: u32) -> Result<u64, MoneyError> {
    let unit = 10u64.pow(base_scale);
    let wide = (price as u128) * (qty as u128) / (unit as u128);
    if wide > u64::MAX as u128 {
        Err(MoneyError::Overflow)
    } else {
        Ok(wide as u64)
    }
}

/// Divide with round-half-to-even, the rounding mode for commissions.
///
/// Returns `numer / denom` rounded to the nearest integer, ties to even.
#[inline]
pub fn div_round_half_even(numer: u128, denom: u128) -> u128 {
    let q = numer / denom;
    let r = numer % denom;
    match (r * 2).cmp(&denom) {
        std::cmp::Ordering::Less => q,
        std::cmp::Ordering::Greater => q + 1,
        std::cmp::Ordering::Equal => {
            if q % 2 == 0 {
                q
            } else {
                q + 1
            }
        }
    }
}
