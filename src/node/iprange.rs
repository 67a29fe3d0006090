//! IPv4 range expressions for network scans.
//!
//! A range is a comma-separated list of items:
//!
//! | Item                        | Meaning                               |
//! |-----------------------------|---------------------------------------|
//! | `10.0.0.7`                  | one address                           |
//! | `10.0.0.1-10.0.0.254`       | inclusive span of full addresses      |
//! | `10.0.0.1-254`              | inclusive span of the last octet      |
//! | `10.0.0.0/24`               | usable hosts of a CIDR block          |

use std::collections::HashSet;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Upper bound on addresses a single scan may expand to.
pub const MAX_ADDRESSES: usize = 65_536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid IP address: {0}")]
    Address(String),
    #[error("invalid range: {0}")]
    Range(String),
    #[error("range expands to more than 65536 addresses")]
    TooLarge,
    #[error("empty IP range")]
    Empty,
}

/// Expand a range expression into addresses, in input order, without duplicates.
pub fn parse_ip_range(expr: &str) -> Result<Vec<Ipv4Addr>, RangeError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for item in expr.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (start, end) = parse_item(item)?;
        let count = (u64::from(end) - u64::from(start) + 1) as usize;
        if out.len() + count > MAX_ADDRESSES {
            return Err(RangeError::TooLarge);
        }
        for n in start..=end {
            let ip = Ipv4Addr::from(n);
            if seen.insert(ip) {
                out.push(ip);
            }
        }
    }

    if out.is_empty() {
        return Err(RangeError::Empty);
    }
    Ok(out)
}

/// Inclusive `(start, end)` as integers.
fn parse_item(item: &str) -> Result<(u32, u32), RangeError> {
    if let Some((base, prefix)) = item.split_once('/') {
        return parse_cidr(item, base, prefix);
    }

    let Some((lo, hi)) = item.split_once('-') else {
        let ip = parse_addr(item)?;
        return Ok((ip, ip));
    };

    let start = parse_addr(lo.trim())?;
    let hi = hi.trim();
    let end = if hi.contains('.') {
        parse_addr(hi)?
    } else {
        let last: u8 = hi.parse().map_err(|_| RangeError::Range(item.to_string()))?;
        (start & 0xffff_ff00) | u32::from(last)
    };

    if end < start {
        return Err(RangeError::Range(item.to_string()));
    }
    Ok((start, end))
}

fn parse_cidr(item: &str, base: &str, prefix: &str) -> Result<(u32, u32), RangeError> {
    let base = parse_addr(base.trim())?;
    let prefix: u32 = prefix
        .trim()
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| RangeError::Range(item.to_string()))?;

    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = base & mask;
    let broadcast = network | !mask;
    // /31 and /32 have no network or broadcast address to skip.
    if prefix >= 31 {
        Ok((network, broadcast))
    } else {
        Ok((network + 1, broadcast - 1))
    }
}

fn parse_addr(s: &str) -> Result<u32, RangeError> {
    s.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| RangeError::Address(s.to_string()))
}
