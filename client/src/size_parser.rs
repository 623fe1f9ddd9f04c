//! Human-readable sizes.

use anyhow::{anyhow, Result};

/// Parses a size such as `512KiB`, `4MB` or `1048576` into bytes.
///
/// Binary units (`KiB`, `MiB`, `GiB`, and their one-letter forms) are
/// powers of 1024. Decimal units (`KB`, `MB`, `GB`) are powers of 1000.
/// Units are case-insensitive.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }

    let split_pos = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| anyhow!("Invalid size: {:?}", s))?;

    let (number, unit) = s.split_at(split_pos);
    let number: f64 = number
        .parse()
        .map_err(|_| anyhow!("Invalid size: {:?}", s))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "B" => 1,
        "K" | "KIB" => 1 << 10,
        "M" | "MIB" => 1 << 20,
        "G" | "GIB" => 1 << 30,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        unit => {
            return Err(anyhow!(
                "Unknown unit {:?}; expected one of B, KB, MB, GB, KiB, MiB, GiB",
                unit
            ))
        }
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(anyhow!("Size {:?} is too large", s));
    }

    Ok(bytes as u64)
}
