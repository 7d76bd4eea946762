use alloy::primitives::U256;

use crate::errors::CoreError;

/// Places shown for human-facing balances (e.g. `"1.0000"`).
pub const DISPLAY_PLACES: u32 = 4;

fn invalid(msg: impl Into<String>) -> CoreError {
    CoreError::InvalidInput(msg.into())
}

fn pow10(decimals: u32) -> Result<U256, CoreError> {
    U256::from(10_u64)
        .checked_pow(U256::from(decimals))
        .ok_or_else(|| invalid("decimals too large"))
}

/// Parse a hex-encoded integer as returned by EVM JSON-RPC (`"0x0de0b6b3a7640000"`).
///
/// An empty payload (`"0x"`) is zero.
pub fn parse_hex_u256(s: &str) -> Result<U256, CoreError> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).map_err(|e| invalid(format!("invalid hex amount {s}: {e}")))
}

pub fn parse_amount_base(s: &str) -> Result<U256, CoreError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(invalid("empty amount"));
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(format!("invalid base amount: {s}")));
    }
    U256::from_str_radix(s, 10).map_err(|e| invalid(format!("invalid base amount {s}: {e}")))
}

fn split_decimal(s: &str) -> Result<(&str, &str), CoreError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(invalid("empty amount"));
    }
    if s.starts_with('-') {
        return Err(invalid("amount must be non-negative"));
    }
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    let digits_ok = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    if !digits_ok(whole) || !digits_ok(frac) || (whole.is_empty() && frac.is_empty()) {
        return Err(invalid(format!("invalid decimal amount: {s}")));
    }
    Ok((whole, frac))
}

pub fn parse_amount_ui_to_base(s: &str, decimals: u8) -> Result<U256, CoreError> {
    let (whole, frac) = split_decimal(s)?;
    let decimals_usize = usize::from(decimals);
    if frac.len() > decimals_usize {
        return Err(invalid(format!(
            "too many decimal places for token (decimals={decimals})"
        )));
    }

    let mut digits = String::with_capacity(whole.len() + decimals_usize);
    digits.push_str(whole);
    digits.push_str(frac);
    for _ in frac.len()..decimals_usize {
        digits.push('0');
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 10).map_err(|_| invalid("amount overflow"))
}

/// Format a base-unit integer amount into a UI decimal string without using floats.
///
/// Examples:
/// - base=1500000, decimals=6 => "1.5"
/// - base=1, decimals=6 => "0.000001"
pub fn format_base_to_ui(base: U256, decimals: u8) -> Result<String, CoreError> {
    if decimals == 0 {
        return Ok(base.to_string());
    }
    let scale = pow10(u32::from(decimals))?;
    let whole = base / scale;
    let frac = base % scale;
    if frac.is_zero() {
        return Ok(whole.to_string());
    }
    let mut frac_s = format!("{:0>width$}", frac.to_string(), width = usize::from(decimals));
    while frac_s.ends_with('0') {
        frac_s.pop();
    }
    Ok(format!("{whole}.{frac_s}"))
}

/// Round a non-negative decimal string half-up to exactly `places` fractional digits.
pub fn round_to_places(ui: &str, places: u32) -> Result<String, CoreError> {
    let (whole, frac) = split_decimal(ui)?;
    let places_usize = usize::try_from(places).map_err(|_| invalid("places too large"))?;

    let kept: String = frac.chars().chain(std::iter::repeat('0')).take(places_usize).collect();
    let round_up = frac.chars().nth(places_usize).is_some_and(|c| c >= '5');

    let digits = format!("{whole}{kept}");
    let digits = digits.trim_start_matches('0');
    let mut scaled = if digits.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(digits, 10).map_err(|_| invalid("amount overflow"))?
    };
    if round_up {
        scaled = scaled
            .checked_add(U256::from(1_u8))
            .ok_or_else(|| invalid("amount overflow"))?;
    }

    let mut s = format!("{:0>width$}", scaled.to_string(), width = places_usize + 1);
    if places_usize > 0 {
        s.insert(s.len() - places_usize, '.');
    }
    Ok(s)
}

pub fn display_base(base: U256, decimals: u8) -> Result<String, CoreError> {
    round_to_places(&format_base_to_ui(base, decimals)?, DISPLAY_PLACES)
}
