//! Address parsing and formatting utilities.
//!
//! Selectors use the setkey notation `ADDR[/PREFIX][[PORT]]`:
//!
//! ```
//! use pfkey::util::addr::parse_selector;
//!
//! let (addr, prefix, port) = parse_selector("10.0.0.0/8[500]").unwrap();
//! assert_eq!(addr.to_string(), "10.0.0.0");
//! assert_eq!((prefix, port), (8, 500));
//! ```

use std::net::IpAddr;

/// Address or selector that failed to parse.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

pub type Result<T> = std::result::Result<T, AddrError>;

/// Parse a bare address.
pub fn parse_addr(s: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|_| AddrError::InvalidAddress(s.to_string()))
}

fn max_prefix(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}

/// Parse `ADDR[/PREFIX]`. Without a prefix the address is a host.
pub fn parse_prefix(s: &str) -> Result<(IpAddr, u8)> {
    let (addr_str, prefix_str) = match s.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (s, None),
    };
    let addr = parse_addr(addr_str)?;
    let max = max_prefix(&addr);
    let Some(prefix_str) = prefix_str else {
        return Ok((addr, max));
    };
    match prefix_str.parse::<u8>() {
        Ok(prefix) if prefix <= max => Ok((addr, prefix)),
        Ok(prefix) => Err(AddrError::InvalidPrefix(format!("/{prefix} is longer than /{max}"))),
        Err(_) => Err(AddrError::InvalidPrefix(prefix_str.to_string())),
    }
}

/// Parse a selector address, `ADDR[/PREFIX][[PORT]]`. A missing port is
/// the wildcard 0.
pub fn parse_selector(s: &str) -> Result<(IpAddr, u8, u16)> {
    let (cidr, port) = match s.split_once('[') {
        Some((cidr, rest)) => {
            let port_str = rest
                .strip_suffix(']')
                .ok_or_else(|| AddrError::InvalidPort(rest.to_string()))?;
            let port = match port_str {
                "any" => 0,
                p => p
                    .parse()
                    .map_err(|_| AddrError::InvalidPort(p.to_string()))?,
            };
            (cidr, port)
        }
        None => (s, 0),
    };
    let (addr, prefix) = parse_prefix(cidr)?;
    Ok((addr, prefix, port))
}

/// `ADDR/PREFIX`.
pub fn format_prefix(addr: &IpAddr, prefix: u8) -> String {
    format!("{addr}/{prefix}")
}

/// Format a selector address, leaving out a wildcard port.
pub fn format_selector(addr: &IpAddr, prefix: u8, port: u16) -> String {
    if port == 0 {
        format_prefix(addr, prefix)
    } else {
        format!("{addr}/{prefix}[{port}]")
    }
}
