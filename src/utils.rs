//! Utility functions and helpers
//!
//! Common utilities used throughout the pool.

use crate::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in seconds since Unix epoch
pub fn current_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Format a hash rate with a metric unit
pub fn format_hash_rate(hashes_per_sec: f64) -> String {
    const UNITS: &[&str] = &["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s"];
    let mut rate = hashes_per_sec;
    let mut unit_index = 0;

    while rate >= 1000.0 && unit_index < UNITS.len() - 1 {
        rate /= 1000.0;
        unit_index += 1;
    }

    format!("{:.2} {}", rate, UNITS[unit_index])
}

/// Validate hex string format
pub fn validate_hex_string(s: &str, expected_len: Option<usize>) -> Result<()> {
    if let Some(len) = expected_len {
        if s.len() != len {
            return Err(Error::protocol(format!(
                "expected {} hex chars, got {}",
                len,
                s.len()
            )));
        }
    }

    if !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::protocol("string contains non-hexadecimal characters"));
    }

    Ok(())
}

/// Convert hex string to bytes, optionally checking the decoded length
pub fn hex_to_bytes(hex: &str, expected_bytes: Option<usize>) -> Result<Vec<u8>> {
    validate_hex_string(hex, expected_bytes.map(|n| n * 2))?;
    hex::decode(hex).map_err(|e| Error::protocol(format!("invalid hex: {}", e)))
}

/// Clamp a value between min and max
pub fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}
