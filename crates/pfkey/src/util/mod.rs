//! Shared utilities for pfkey.

pub mod addr;

pub use addr::{format_prefix, format_selector, parse_addr, parse_prefix, parse_selector};
