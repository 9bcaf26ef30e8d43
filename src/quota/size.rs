//! Human-readable byte sizes for quota limits

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Size unit accepted on the command line and in config files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Byte,
    Kilobyte,
    Megabyte,
    Gigabyte,
    Terabyte,
    Kibibyte,
    Mebibyte,
    Gibibyte,
    Tebibyte,
}

impl Unit {
    /// Number of bytes in one unit
    pub fn bytes(self) -> u64 {
        match self {
            Unit::Byte => 1,
            Unit::Kilobyte => 1000,
            Unit::Megabyte => 1000u64.pow(2),
            Unit::Gigabyte => 1000u64.pow(3),
            Unit::Terabyte => 1000u64.pow(4),
            Unit::Kibibyte => 1024,
            Unit::Mebibyte => 1024u64.pow(2),
            Unit::Gibibyte => 1024u64.pow(3),
            Unit::Tebibyte => 1024u64.pow(4),
        }
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "B" => Ok(Unit::Byte),
            "kB" => Ok(Unit::Kilobyte),
            "MB" => Ok(Unit::Megabyte),
            "GB" => Ok(Unit::Gigabyte),
            "TB" => Ok(Unit::Terabyte),
            "K" | "KB" | "KiB" => Ok(Unit::Kibibyte),
            "M" | "MiB" => Ok(Unit::Mebibyte),
            "G" | "GiB" => Ok(Unit::Gibibyte),
            "T" | "TiB" => Ok(Unit::Tebibyte),
            other => Err(Error::InvalidSize(format!("unknown unit '{}'", other))),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unit::Byte => "B",
            Unit::Kilobyte => "kB",
            Unit::Megabyte => "MB",
            Unit::Gigabyte => "GB",
            Unit::Terabyte => "TB",
            Unit::Kibibyte => "KiB",
            Unit::Mebibyte => "MiB",
            Unit::Gibibyte => "GiB",
            Unit::Tebibyte => "TiB",
        };
        f.pad(s)
    }
}

/// Parse a size such as `15`, `15K`, `1.5GiB` or `10MB` into bytes
pub fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::InvalidSize("empty size".to_string()));
    }

    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::InvalidSize(format!("invalid number in '{}'", input)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidSize(format!("out of range: '{}'", input)));
    }

    let unit: Unit = unit.trim().parse()?;
    let bytes = value * unit.bytes() as f64;
    if bytes > u64::MAX as f64 {
        return Err(Error::InvalidSize(format!("too large: '{}'", input)));
    }
    Ok(bytes as u64)
}

/// Render a byte count with the largest binary unit that keeps it >= 1
pub fn format_size(bytes: u64) -> String {
    let units = [Unit::Tebibyte, Unit::Gibibyte, Unit::Mebibyte, Unit::Kibibyte];
    for unit in units {
        if bytes >= unit.bytes() {
            return format!("{:.1}{}", bytes as f64 / unit.bytes() as f64, unit);
        }
    }
    format!("{}B", bytes)
}
