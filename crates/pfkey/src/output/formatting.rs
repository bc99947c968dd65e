//! Names and number formats used by the printers.
//!
//! ```
//! use pfkey::output::formatting::{format_bytes, format_duration_compact, format_spi};
//! use std::time::Duration;
//!
//! assert_eq!(format_bytes(1024), "1.00 KiB");
//! assert_eq!(format_duration_compact(Duration::from_secs(90)), "1m 30s");
//! assert_eq!(format_spi(0x1234), "0x00001234");
//! ```

use std::time::Duration;

use crate::key::algorithm::{aalg, calg, ealg};
use crate::key::ext::policy_dir;
use crate::key::message::satype;
use crate::key::policy::{Level, PolicyKind};

/// Byte counter with a binary unit, two decimals above 1 KiB.
///
/// ```
/// use pfkey::output::formatting::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(3 << 20), "3.00 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Seconds as `1d 2h 3m 4s`, zero fields left out.
///
/// ```
/// use pfkey::output::formatting::format_duration_compact;
/// use std::time::Duration;
///
/// assert_eq!(format_duration_compact(Duration::from_secs(28_800)), "8h");
/// assert_eq!(format_duration_compact(Duration::from_secs(86_461)), "1d 1m 1s");
/// ```
pub fn format_duration_compact(duration: Duration) -> String {
    let mut left = duration.as_secs();
    let mut out = Vec::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        let n = left / size;
        left %= size;
        if n > 0 {
            out.push(format!("{n}{unit}"));
        }
    }
    if out.is_empty() {
        return "0s".to_string();
    }
    out.join(" ")
}

/// Format a lifetime limit in seconds; zero means no limit.
pub fn format_limit(secs: u64) -> String {
    if secs == 0 {
        "none".to_string()
    } else {
        format_duration_compact(Duration::from_secs(secs))
    }
}

/// Format an SPI the way setkey prints it.
pub fn format_spi(spi: u32) -> String {
    format!("{:#010x}", spi)
}

/// Name of a header SA type.
pub fn satype_name(v: u8) -> &'static str {
    match v {
        satype::UNSPEC => "unspec",
        satype::AH => "ah",
        satype::ESP => "esp",
        satype::RSVP => "rsvp",
        satype::OSPFV2 => "ospfv2",
        satype::RIPV2 => "ripv2",
        satype::MIP => "mip",
        satype::IPCOMP => "ipcomp",
        _ => "unknown",
    }
}

/// Name of an authentication algorithm.
pub fn auth_name(id: u8) -> &'static str {
    match id {
        aalg::NONE => "none",
        aalg::MD5HMAC => "hmac-md5",
        aalg::SHA1HMAC => "hmac-sha1",
        aalg::SHA2_256 => "hmac-sha256",
        aalg::SHA2_384 => "hmac-sha384",
        aalg::SHA2_512 => "hmac-sha512",
        aalg::RIPEMD160HMAC => "hmac-ripemd160",
        aalg::AES_XCBC_MAC => "aes-xcbc-mac",
        aalg::NULL => "null",
        _ => "unknown",
    }
}

/// Name of an encryption algorithm.
pub fn enc_name(id: u8) -> &'static str {
    match id {
        ealg::NONE => "none",
        ealg::DESCBC => "des-cbc",
        ealg::DES3CBC => "3des-cbc",
        ealg::CAST128CBC => "cast128-cbc",
        ealg::BLOWFISHCBC => "blowfish-cbc",
        ealg::NULL => "null",
        ealg::AESCBC => "aes-cbc",
        ealg::AESCTR => "aes-ctr",
        _ => "unknown",
    }
}

/// Name of a compression algorithm.
pub fn comp_name(id: u8) -> &'static str {
    match id {
        calg::NONE => "none",
        calg::OUI => "oui",
        calg::DEFLATE => "deflate",
        calg::LZS => "lzs",
        _ => "unknown",
    }
}

pub fn policy_kind_name(kind: PolicyKind) -> &'static str {
    match kind {
        PolicyKind::Discard => "discard",
        PolicyKind::None => "none",
        PolicyKind::Ipsec => "ipsec",
        PolicyKind::Entrust => "entrust",
        PolicyKind::Bypass => "bypass",
    }
}

pub fn policy_dir_name(dir: u8) -> &'static str {
    match dir {
        policy_dir::INBOUND => "in",
        policy_dir::OUTBOUND => "out",
        policy_dir::ANY => "any",
        _ => "unknown",
    }
}

pub fn level_name(level: Level) -> &'static str {
    match level {
        Level::Default => "default",
        Level::Use => "use",
        Level::Require => "require",
        Level::Unique => "unique",
    }
}
