//! Difficulty arithmetic
//!
//! Conversions between compact "bits", floating-point difficulty, 256-bit
//! targets and hashes. Every conversion is relative to a family's
//! difficulty-1 bits (`0x1d00ffff` for Bitcoin, `0x1f07ffff` for Equihash).
//!
//! ```text
//! difficulty = target(diff1) / target
//! ```
//!
//! Difficulties below 1.0 are legal (test networks, tiny share targets);
//! their targets exceed the diff-1 target and saturate at 2^256 - 1.

use crate::crypto::Hash256;
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

const MANTISSA_MASK: u32 = 0x007f_ffff;
const MANTISSA_MIN: f64 = 32_768.0; // 0x8000
const MANTISSA_LIMIT: f64 = 8_388_608.0; // 0x800000

/// Scale used to carry fractional difficulties through integer division
const FRACTION_SCALE: f64 = 18_446_744_073_709_551_616.0; // 2^64

fn split_bits(bits: u32) -> (i32, f64) {
    let exponent = (bits >> 24) as i32;
    let mantissa = (bits & MANTISSA_MASK) as f64;
    (exponent, mantissa)
}

/// The target encoded by compact `bits`, as an `f64`
pub fn bits_to_target_f64(bits: u32) -> f64 {
    let (exponent, mantissa) = split_bits(bits);
    mantissa * 256f64.powi(exponent - 3)
}

/// The target encoded by compact `bits`, exact
pub fn bits_to_target(bits: u32) -> BigUint {
    let exponent = bits >> 24;
    let mantissa = BigUint::from(bits & MANTISSA_MASK);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent) as usize)
    } else {
        mantissa << (8 * (exponent - 3) as usize)
    }
}

/// Difficulty represented by compact `bits`
pub fn bits_to_difficulty(bits: u32, diff1_bits: u32) -> f64 {
    let (exponent, mantissa) = split_bits(bits);
    if mantissa == 0.0 {
        return f64::INFINITY;
    }
    let (exponent1, mantissa1) = split_bits(diff1_bits);
    (mantissa1 / mantissa) * 256f64.powi(exponent1 - exponent)
}

/// Compact bits for `difficulty`, normalized so the mantissa keeps its
/// sign bit clear and uses at least two significant bytes
pub fn difficulty_to_bits(difficulty: f64, diff1_bits: u32) -> u32 {
    if !(difficulty.is_finite() && difficulty > 0.0) {
        return diff1_bits;
    }

    let (mut exponent, mantissa1) = split_bits(diff1_bits);
    let mut mantissa = mantissa1 / difficulty;

    while mantissa >= MANTISSA_LIMIT {
        mantissa /= 256.0;
        exponent += 1;
    }
    while mantissa < MANTISSA_MIN && exponent > 1 {
        mantissa *= 256.0;
        exponent -= 1;
    }

    let mut mantissa = mantissa.round() as u32;
    if mantissa >= 0x0080_0000 {
        mantissa >>= 8;
        exponent += 1;
    }

    let exponent = exponent.clamp(1, 0xff) as u32;
    (exponent << 24) | (mantissa & MANTISSA_MASK)
}

/// Hash interpreted as a little-endian 256-bit integer, as `f64`
pub fn hash_to_f64(hash: &Hash256) -> f64 {
    hash.as_bytes()
        .iter()
        .rev()
        .fold(0.0, |acc, &byte| acc * 256.0 + byte as f64)
}

/// Effective difficulty of a proof-of-work hash
///
/// An all-zero hash is treated as the value one, keeping the result finite.
pub fn hash_to_difficulty(hash: &Hash256, diff1_bits: u32) -> f64 {
    let value = hash_to_f64(hash).max(1.0);
    bits_to_target_f64(diff1_bits) / value
}

/// 256-bit target for `difficulty`, big-endian
pub fn difficulty_to_target(difficulty: f64, diff1_bits: u32) -> [u8; 32] {
    let max = [0xffu8; 32];
    if !(difficulty.is_finite() && difficulty > 0.0) {
        return max;
    }

    let scaled = match (difficulty * FRACTION_SCALE).round().to_u128() {
        Some(value) if value > 0 => BigUint::from(value),
        Some(_) => return max,
        // Above u128 range: fall back to the integer part
        None => match BigUint::parse_bytes(format!("{:.0}", difficulty).as_bytes(), 10) {
            Some(value) if !value.is_zero() => {
                return to_be_32(&(bits_to_target(diff1_bits) / value));
            }
            _ => return [0u8; 32],
        },
    };

    let numerator = bits_to_target(diff1_bits) << 64usize;
    to_be_32(&(numerator / scaled))
}

fn to_be_32(value: &BigUint) -> [u8; 32] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; 32];
    if bytes.len() > 32 {
        return [0xffu8; 32];
    }
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BTC_DIFF1: u32 = 0x1d00ffff;
    const EQUIHASH_DIFF1: u32 = 0x1f07ffff;

    #[test]
    fn test_diff1_bits_is_difficulty_one() {
        assert_eq!(bits_to_difficulty(BTC_DIFF1, BTC_DIFF1), 1.0);
        assert_eq!(bits_to_difficulty(EQUIHASH_DIFF1, EQUIHASH_DIFF1), 1.0);
        assert_eq!(difficulty_to_bits(1.0, BTC_DIFF1), BTC_DIFF1);
    }

    #[test]
    fn test_known_mainnet_difficulty() {
        // Block 100000
        let diff = bits_to_difficulty(0x1b04864c, BTC_DIFF1);
        assert!((diff - 14_484.162_361).abs() < 0.001);
    }

    #[test]
    fn test_bits_to_target_exact() {
        let target = bits_to_target(BTC_DIFF1);
        let expected = BigUint::from(0xffffu32) << 208usize;
        assert_eq!(target, expected);
        assert_eq!(bits_to_target(0x0300ffff), BigUint::from(0xffffu32));
        assert_eq!(bits_to_target(0x0200ffff), BigUint::from(0xffu32));
    }

    #[test]
    fn test_hash_to_difficulty() {
        // A hash exactly equal to the diff-1 target has difficulty one
        let mut bytes = [0u8; 32];
        bytes[26] = 0xff;
        bytes[27] = 0xff;
        let hash = Hash256::from_bytes(bytes);
        assert_eq!(hash_to_difficulty(&hash, BTC_DIFF1), 1.0);

        // Half the value, double the difficulty
        bytes[27] = 0x7f;
        bytes[26] = 0xff;
        let hash = Hash256::from_bytes(bytes);
        assert!((hash_to_difficulty(&hash, BTC_DIFF1) - 2.0).abs() < 1e-3);

        let zero = Hash256::ZERO;
        assert!(hash_to_difficulty(&zero, BTC_DIFF1).is_finite());
    }

    #[test]
    fn test_difficulty_to_target() {
        let target = difficulty_to_target(1.0, BTC_DIFF1);
        let mut expected = [0u8; 32];
        expected[4] = 0xff;
        expected[5] = 0xff;
        assert_eq!(target, expected);

        let target = difficulty_to_target(2.0, BTC_DIFF1);
        let mut expected = [0u8; 32];
        expected[4] = 0x7f;
        expected[5] = 0xff;
        expected[6] = 0x80;
        assert_eq!(target, expected);

        // Tiny difficulties saturate
        assert_eq!(difficulty_to_target(1e-80, BTC_DIFF1), [0xff; 32]);
        assert_eq!(difficulty_to_target(0.0, BTC_DIFF1), [0xff; 32]);
    }

    #[test]
    fn test_fractional_difficulty_target_is_larger() {
        let one = BigUint::from_bytes_be(&difficulty_to_target(1.0, EQUIHASH_DIFF1));
        let half = BigUint::from_bytes_be(&difficulty_to_target(0.5, EQUIHASH_DIFF1));
        assert!(half > one);
    }

    proptest! {
        #[test]
        fn prop_bits_roundtrip(exponent in 4u32..=0x1f, mantissa in 0x8000u32..=0x7fffff) {
            let bits = (exponent << 24) | mantissa;
            let difficulty = bits_to_difficulty(bits, BTC_DIFF1);
            let back = difficulty_to_bits(difficulty, BTC_DIFF1);

            // Same encoded target, give or take one mantissa unit
            let original = bits_to_target_f64(bits);
            let recovered = bits_to_target_f64(back);
            let unit = 256f64.powi(exponent as i32 - 3);
            prop_assert!((original - recovered).abs() <= unit * 1.000_001);
        }

        #[test]
        fn prop_higher_difficulty_smaller_target(a in 0.001f64..1e12, factor in 1.01f64..100.0) {
            let easy = BigUint::from_bytes_be(&difficulty_to_target(a, BTC_DIFF1));
            let hard = BigUint::from_bytes_be(&difficulty_to_target(a * factor, BTC_DIFF1));
            prop_assert!(hard < easy);
        }
    }
}
