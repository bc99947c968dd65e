//! Printable view of an SA message.

use std::io::Write;
use std::net::IpAddr;

use crate::key::ext::{AddressExt, ExtType, LifetimeExt};
use crate::key::message::satype;
use crate::key::parse::Envelope;
use crate::key::sa::SaState;
use crate::output::formatting::{
    auth_name, comp_name, enc_name, format_bytes, format_limit, format_spi, satype_name,
};
use crate::output::{OutputOptions, Printable};

/// The parts of a Get or Dump reply worth showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaRecord {
    pub satype: u8,
    pub spi: u32,
    pub state: u8,
    pub auth: u8,
    pub encrypt: u8,
    pub replay: u8,
    pub flags: u32,
    pub src: AddressExt,
    pub dst: AddressExt,
    pub proxy: Option<IpAddr>,
    pub current: Option<LifetimeExt>,
    pub hard: Option<LifetimeExt>,
    pub soft: Option<LifetimeExt>,
    pub seq: u32,
    pub pid: u32,
}

impl SaRecord {
    /// Lift an SA out of a message. `None` when the SA or an address
    /// extension is missing.
    pub fn from_envelope(env: &Envelope) -> Option<Self> {
        let sa = env.exts.sa()?;
        Some(Self {
            satype: env.satype(),
            spi: sa.spi,
            state: sa.state,
            auth: sa.auth,
            encrypt: sa.encrypt,
            replay: sa.replay,
            flags: sa.flags,
            src: *env.exts.src()?,
            dst: *env.exts.dst()?,
            proxy: env.exts.proxy().map(|p| p.addr),
            current: env.exts.lifetime(ExtType::LifetimeCurrent).copied(),
            hard: env.exts.lifetime(ExtType::LifetimeHard).copied(),
            soft: env.exts.lifetime(ExtType::LifetimeSoft).copied(),
            seq: env.seq(),
            pid: env.pid(),
        })
    }

    fn state_name(&self) -> String {
        SaState::from_u8(self.state)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("state{}", self.state))
    }

    fn mode(&self) -> &'static str {
        if self.proxy.is_some() {
            "tunnel"
        } else {
            "transport"
        }
    }

    fn algorithms(&self) -> Vec<(&'static str, &'static str)> {
        match self.satype {
            satype::IPCOMP => vec![("C", comp_name(self.encrypt))],
            satype::AH => vec![("A", auth_name(self.auth))],
            _ => {
                let mut algs = vec![("E", enc_name(self.encrypt))];
                if self.auth != 0 {
                    algs.push(("A", auth_name(self.auth)));
                }
                algs
            }
        }
    }
}

impl Printable for SaRecord {
    fn print_text<W: Write>(&self, w: &mut W, opts: &OutputOptions) -> std::io::Result<()> {
        writeln!(w, "{} {}", self.src.addr, self.dst.addr)?;
        write!(
            w,
            "\t{} mode={} spi={}",
            satype_name(self.satype),
            self.mode(),
            format_spi(self.spi)
        )?;
        if let Some(proxy) = self.proxy {
            write!(w, " proxy={}", proxy)?;
        }
        writeln!(w)?;

        write!(w, "\t")?;
        for (tag, name) in self.algorithms() {
            write!(w, "{}: {}  ", tag, name)?;
        }
        writeln!(w)?;

        writeln!(
            w,
            "\tstate={} replay={} seq={} pid={}",
            self.state_name(),
            self.replay,
            self.seq,
            self.pid
        )?;

        if opts.details {
            if let Some(cur) = &self.current {
                writeln!(
                    w,
                    "\tcurrent: {} allocations={}",
                    format_bytes(cur.bytes),
                    cur.allocations
                )?;
            }
            if let Some(hard) = &self.hard {
                writeln!(
                    w,
                    "\thard: add={} use={} bytes={}",
                    format_limit(hard.add_time),
                    format_limit(hard.use_time),
                    hard.bytes
                )?;
            }
            if let Some(soft) = &self.soft {
                writeln!(
                    w,
                    "\tsoft: add={} use={} bytes={}",
                    format_limit(soft.add_time),
                    format_limit(soft.use_time),
                    soft.bytes
                )?;
            }
        }
        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "satype": satype_name(self.satype),
            "spi": self.spi,
            "state": self.state_name(),
            "mode": self.mode(),
            "src": self.src.addr.to_string(),
            "dst": self.dst.addr.to_string(),
            "replay": self.replay,
            "seq": self.seq,
            "pid": self.pid,
        });

        for (tag, name) in self.algorithms() {
            let key = match tag {
                "E" => "encrypt",
                "A" => "auth",
                _ => "compress",
            };
            obj[key] = serde_json::json!(name);
        }
        if let Some(proxy) = self.proxy {
            obj["proxy"] = serde_json::json!(proxy.to_string());
        }
        if let Some(cur) = &self.current {
            obj["current"] = lifetime_json(cur);
        }
        if let Some(hard) = &self.hard {
            obj["hard"] = lifetime_json(hard);
        }
        if let Some(soft) = &self.soft {
            obj["soft"] = lifetime_json(soft);
        }

        obj
    }
}

pub(super) fn lifetime_json(lt: &LifetimeExt) -> serde_json::Value {
    serde_json::json!({
        "allocations": lt.allocations,
        "bytes": lt.bytes,
        "add_time": lt.add_time,
        "use_time": lt.use_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::algorithm::{aalg, ealg};
    use crate::key::builder::MessageBuilder;
    use crate::key::ext::SaExt;
    use crate::key::message::MessageType;
    use crate::key::parse::check_envelope;
    use crate::output::OutputFormat;

    fn record() -> SaRecord {
        let mut b = MessageBuilder::new(MessageType::Dump, satype::ESP);
        b.sa(SaExt {
            spi: 0x1234,
            replay: 4,
            state: SaState::Mature.number(),
            auth: aalg::SHA1HMAC,
            encrypt: ealg::AESCBC,
            flags: 0,
        })
        .host(ExtType::AddressSrc, "192.0.2.1".parse().unwrap())
        .host(ExtType::AddressDst, "198.51.100.7".parse().unwrap())
        .lifetime(
            ExtType::LifetimeCurrent,
            LifetimeExt {
                bytes: 2048,
                ..Default::default()
            },
        );
        let env = check_envelope(&b.finish()).unwrap();
        SaRecord::from_envelope(&env).unwrap()
    }

    #[test]
    fn test_sa_text() {
        let mut out = Vec::new();
        record()
            .print_text(&mut out, &OutputOptions { details: true, pretty: false })
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("192.0.2.1 198.51.100.7\n"));
        assert!(text.contains("esp mode=transport spi=0x00001234"));
        assert!(text.contains("E: aes-cbc"));
        assert!(text.contains("A: hmac-sha1"));
        assert!(text.contains("state=mature"));
        assert!(text.contains("current: 2.00 KiB"));
    }

    #[test]
    fn test_sa_json() {
        let mut out = Vec::new();
        record()
            .print(&mut out, OutputFormat::Json, &OutputOptions::default())
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json["spi"], 0x1234);
        assert_eq!(json["encrypt"], "aes-cbc");
        assert_eq!(json["current"]["bytes"], 2048);
        assert!(json.get("proxy").is_none());
    }

    #[test]
    fn test_missing_sa() {
        let msg = MessageBuilder::new(MessageType::Dump, satype::ESP).finish();
        let env = check_envelope(&msg).unwrap();
        assert!(SaRecord::from_envelope(&env).is_none());
    }
}
