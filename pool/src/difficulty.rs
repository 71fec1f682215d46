/// Difficulty <-> target conversions
///
/// All targets are 256-bit big-endian values rendered as 64 lowercase hex
/// digits. Difficulty 1 corresponds to `DIFF1_TARGET_HEX`.

use num_bigint::BigUint;
use num_traits::{Num, ToPrimitive, Zero};

/// Target at difficulty 1 (`1f` followed by 62 `f`).
pub const DIFF1_TARGET_HEX: &str =
    "1fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

/// Easiest target a client may request through its connection path.
pub const MAX_REQUEST_TARGET_HEX: &str =
    "1f00000000000000000000000000000000000000000000000000000000000000";

/// Fixed-point scale used when dividing by fractional difficulties.
const DIFFICULTY_SCALE: u64 = 1_000_000;

pub fn diff1_target() -> BigUint {
    parse_target(DIFF1_TARGET_HEX).unwrap_or_default()
}

/// Parse a hex target (optional `0x` prefix).
pub fn parse_target(hex: &str) -> Option<BigUint> {
    let clean = hex.trim().trim_start_matches("0x");
    if clean.is_empty() {
        return None;
    }
    BigUint::from_str_radix(clean, 16).ok()
}

pub fn format_target(target: &BigUint) -> String {
    format!("{:0>64}", target.to_str_radix(16))
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Initial difficulty requested through a connection path such as `/033`.
///
/// The prefix is right-padded with zeros to 64 digits and capped at
/// `MAX_REQUEST_TARGET_HEX`; the result is `floor(diff1 / target)`, at
/// least 1. Returns `None` for empty, non-hex or zero prefixes.
pub fn difficulty_from_target_prefix(prefix: &str) -> Option<f64> {
    let prefix = prefix.trim().to_lowercase();
    if !is_hex(&prefix) {
        return None;
    }

    let padded = format!("{:0<64}", prefix);
    let mut target = parse_target(&padded)?;
    if target.is_zero() {
        return None;
    }

    let max_target = parse_target(MAX_REQUEST_TARGET_HEX)?;
    if target > max_target {
        target = max_target;
    }

    let difficulty = (diff1_target() / target).to_f64()?;
    Some(difficulty.floor().max(1.0))
}

/// Expand a compact (`nBits`) encoding into a full target.
pub fn expand_compact(nbits: u32) -> BigUint {
    let exponent = nbits >> 24;
    let mantissa = BigUint::from(nbits & 0x007f_ffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent) as usize)
    } else {
        mantissa << (8 * (exponent - 3) as usize)
    }
}

/// Parse an `nBits` string such as `0x1f0fffff` or `1f0fffff`.
pub fn parse_compact(nbits: &str) -> Option<u32> {
    let clean = nbits.trim().trim_start_matches("0x");
    u32::from_str_radix(clean, 16).ok()
}

/// Block difficulty for a compact target, never below 1.
pub fn difficulty_from_compact(nbits: u32) -> f64 {
    let target = expand_compact(nbits);
    if target.is_zero() {
        return 1.0;
    }
    let num = diff1_target().to_f64().unwrap_or(f64::MAX);
    let den = target.to_f64().unwrap_or(f64::MAX);
    let difficulty = num / den;
    if difficulty.is_finite() {
        difficulty.max(1.0)
    } else {
        1.0
    }
}

/// Share target for a (possibly fractional) difficulty.
pub fn target_from_difficulty(difficulty: f64) -> String {
    let difficulty = if difficulty.is_finite() { difficulty.max(1.0) } else { 1.0 };
    let scaled = (difficulty * DIFFICULTY_SCALE as f64).round();
    let divisor = BigUint::from(scaled.min(u128::MAX as f64) as u128);
    let target = diff1_target() * BigUint::from(DIFFICULTY_SCALE) / divisor;
    format_target(&target)
}
