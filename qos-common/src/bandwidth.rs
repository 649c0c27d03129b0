//! Bandwidth strings as they appear in router configuration and `tc` output.
//!
//! Units are decimal, matching `tc`: `1mbit` is 1000 kbit. A bare number is kbit/s.

use crate::{Error, Result};

/// Parses a bandwidth string into kbit/s.
///
/// Accepts plain numbers (kbit/s) and `bit`, `kbit`, `mbit`, `gbit` with their `bps` and
/// single-letter (`k`, `M`, `G`) spellings, case-insensitively. Fractions are allowed and
/// rounded to the nearest kbit.
///
/// # Example
///
/// ```
/// use qos_common::parse_bandwidth_kbps;
/// assert_eq!(parse_bandwidth_kbps("10mbit").unwrap(), 10_000);
/// assert_eq!(parse_bandwidth_kbps("512").unwrap(), 512);
/// assert_eq!(parse_bandwidth_kbps("1.5M").unwrap(), 1_500);
/// ```
pub fn parse_bandwidth_kbps(input: &str) -> Result<u64> {
    let s = input.trim();
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: f64 = number.parse().map_err(|_| Error::InvalidBandwidth(input.to_string()))?;

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "k" | "kbit" | "kbps" | "kbit/s" => 1.0,
        "m" | "mbit" | "mbps" | "mbit/s" => 1_000.0,
        "g" | "gbit" | "gbps" | "gbit/s" => 1_000_000.0,
        "bit" | "bps" | "b" => 0.001,
        _ => return Err(Error::InvalidBandwidth(input.to_string())),
    };

    Ok((value * multiplier).round() as u64)
}

/// Formats kbit/s the way `tc` prints rates, using the largest exact-ish unit.
pub fn format_kbps(kbps: u64) -> String {
    if kbps >= 1_000_000 && kbps % 10_000 == 0 {
        format!("{}Gbit", kbps as f64 / 1_000_000.0)
    } else if kbps >= 1_000 && kbps % 10 == 0 {
        format!("{}Mbit", kbps as f64 / 1_000.0)
    } else {
        format!("{kbps}Kbit")
    }
}
