//! Double-SHA-256, compact-target conversion, and hash/target comparison.
//!
//! Block and share hashes are stored as the raw 32-byte SHA-256 output
//! (little-endian when interpreted as a 256-bit integer). Hex strings shown
//! to humans are byte-reversed into the conventional display order.

use num_bigint::BigUint;
use num_traits::Zero;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("expected 32 bytes, got {0}")]
    BadLength(usize),
}

/// SHA256(SHA256(data)), used for share ids, txids, and merkle nodes.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Byte-reverse into a new vector.
pub fn reverse_bytes(b: &[u8]) -> Vec<u8> {
    b.iter().rev().copied().collect()
}

/// Render a hash in display order (reversed hex).
pub fn hash_to_hex(hash: &[u8; 32]) -> String {
    hex::encode(reverse_bytes(hash))
}

/// Parse a display-order hex string back into internal byte order.
pub fn hex_to_hash(s: &str) -> Result<[u8; 32], HashError> {
    let b = hex::decode(s)?;
    if b.len() != 32 {
        return Err(HashError::BadLength(b.len()));
    }
    let mut h = [0u8; 32];
    for (i, v) in b.iter().rev().enumerate() {
        h[i] = *v;
    }
    Ok(h)
}

// =============================================================================
// Compact (nBits) Targets
// =============================================================================

/// Expand a compact (nBits) representation into a full target.
///
/// High byte is a base-256 exponent, low 23 bits the mantissa. The sign bit
/// (0x00800000) denotes a negative target, which is never valid proof of
/// work, so it decodes to zero here.
pub fn compact_to_target(compact: u32) -> BigUint {
    if compact & 0x0080_0000 != 0 {
        return BigUint::zero();
    }

    let exponent = compact >> 24;
    let mantissa = BigUint::from(compact & 0x007f_ffff);

    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

/// Compress a target into compact (nBits) form.
///
/// If the mantissa's top bit would be set (which the format reserves for the
/// sign), the mantissa is shifted right and the exponent bumped.
pub fn target_to_compact(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let bytes = target.to_bytes_be();
    let mut size = bytes.len() as u32;

    let mut mantissa: u32 = 0;
    if size <= 3 {
        for (i, v) in bytes.iter().enumerate() {
            mantissa |= (*v as u32) << (8 * (2 - i as u32 - (3 - size)));
        }
    } else {
        mantissa = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32);
    }

    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }

    (size << 24) | (mantissa & 0x007f_ffff)
}

/// True iff a hash, read as a little-endian 256-bit integer, is <= target.
pub fn hash_meets_target(hash: &[u8; 32], target: &BigUint) -> bool {
    BigUint::from_bytes_le(hash) <= *target
}

/// Difficulty of a target relative to the given maximum target.
pub fn target_to_difficulty(target: &BigUint, max_target: &BigUint) -> f64 {
    if target.is_zero() {
        return 0.0;
    }
    // Scale the quotient so sub-1.0 difficulties survive integer division.
    const SCALE: u64 = 1_000_000;
    let scaled = (max_target * SCALE) / target;
    scaled
        .to_string()
        .parse::<f64>()
        .map(|v| v / SCALE as f64)
        .unwrap_or(f64::MAX)
}

/// Target for a given pool difficulty relative to the maximum target.
pub fn difficulty_to_target(difficulty: f64, max_target: &BigUint) -> BigUint {
    if difficulty <= 0.0 {
        return max_target.clone();
    }
    const SCALE: u64 = 1_000_000;
    let scaled = (difficulty * SCALE as f64) as u128;
    if scaled == 0 {
        return max_target.clone();
    }
    (max_target * SCALE) / BigUint::from(scaled)
}
