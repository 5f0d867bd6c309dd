//! Command-line value parsing and watchlist loading
//!
//! The watchlist file holds one Ethereum address per line in hex format.
//! Block numbers and headers come straight from command-line flags.

use crate::types::address_key;
use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Load a watchlist from a file.
///
/// Each line should contain one Ethereum address in hex format (with or without 0x prefix).
/// Empty lines and lines starting with '#' are ignored. Addresses come back in
/// canonical lowercase `0x` form.
///
/// # Example file format:
/// ```text
/// 0x742d35Cc6634C0532925a3b844Bc454e4438f44e
/// # This is a comment
/// 0xdAC17F958D2ee523a2206206994597C13D831ec7
/// ```
pub fn load_watchlist(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read watchlist file: {:?}", path))?;

    let mut addresses = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let addr = parse_address(line)
            .with_context(|| format!("Invalid address on line {}: {}", line_num + 1, line))?;
        addresses.push(address_key(&addr));
    }

    if addresses.is_empty() {
        bail!("Watchlist is empty (no valid addresses found)");
    }

    Ok(addresses)
}

/// Parse an address from a hex string, with or without 0x prefix.
pub fn parse_address(s: &str) -> Result<Address> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("Invalid hex address: {}", s))?;

    if bytes.len() != 20 {
        bail!("Address must be 20 bytes (40 hex chars), got {} bytes", bytes.len());
    }

    Ok(Address::from_slice(&bytes))
}

/// Split a comma-separated wallet list into canonical addresses.
pub fn parse_wallets(list: &str) -> Result<Vec<String>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_address(s).map(|addr| address_key(&addr)))
        .collect()
}

/// Parse a block number given either as `0x`-prefixed hex or as decimal.
pub fn parse_block_number(s: &str) -> Result<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16)
            .with_context(|| format!("Invalid hex block number: {}", s)),
        None => s
            .parse()
            .with_context(|| format!("Invalid block number: {}", s)),
    }
}

/// Parse a `Name: value` header.
pub fn parse_header(s: &str) -> Result<(String, String)> {
    let Some((name, value)) = s.split_once(':') else {
        bail!("Header must look like 'Name: value', got {:?}", s);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("Header name is empty in {:?}", s);
    }
    Ok((name.to_string(), value.trim().to_string()))
}
