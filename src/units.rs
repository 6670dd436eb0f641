//! Byte-size string parsing and rounding helpers.
//!
//! Size values in pool and volume config are strings such as `"10GiB"` or
//! `"512MB"`. LVM tools only allocate in multiples of 512 bytes and round LV
//! sizes up to the volume group extent size, so both roundings live here.

use crate::error::{PoolError, Result};

/// Parse a byte-size string into a byte count.
///
/// Accepts a bare integer (bytes), decimal suffixes (`kB`, `MB`, `GB`, `TB`,
/// `PB`, `EB`) and binary suffixes (`KiB`, `MiB`, `GiB`, `TiB`, `PiB`, `EiB`),
/// case-insensitively, with optional whitespace between number and suffix.
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PoolError::InvalidConfig { reason: "Empty size value".to_string() });
    }

    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);

    let count: u64 = digits.parse().map_err(|_| PoolError::InvalidConfig {
        reason: format!("Invalid size value {value:?}"),
    })?;

    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1000,
        "MB" => 1000_u64.pow(2),
        "GB" => 1000_u64.pow(3),
        "TB" => 1000_u64.pow(4),
        "PB" => 1000_u64.pow(5),
        "EB" => 1000_u64.pow(6),
        "KIB" => 1024,
        "MIB" => 1024_u64.pow(2),
        "GIB" => 1024_u64.pow(3),
        "TIB" => 1024_u64.pow(4),
        "PIB" => 1024_u64.pow(5),
        "EIB" => 1024_u64.pow(6),
        _ => {
            return Err(PoolError::InvalidConfig {
                reason: format!("Invalid size suffix in {value:?}"),
            })
        }
    };

    count.checked_mul(multiplier).ok_or_else(|| PoolError::InvalidConfig {
        reason: format!("Size value {value:?} overflows"),
    })
}

/// Round `size` up to the next multiple of `unit`. A `unit` of zero returns
/// `size` unchanged.
pub fn round_up(size: u64, unit: u64) -> u64 {
    if unit == 0 || size % unit == 0 {
        return size;
    }
    size.div_ceil(unit) * unit
}

/// Number of `extent_size` extents needed to hold `size`, rounded up the way
/// `lvresize` does.
pub fn extent_count(size: u64, extent_size: u64) -> u64 {
    if extent_size == 0 {
        return size;
    }
    size.div_ceil(extent_size)
}
