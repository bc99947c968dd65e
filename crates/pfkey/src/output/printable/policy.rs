//! Printable view of a policy message.

use std::io::Write;
use std::net::IpAddr;

use super::sa::lifetime_json;
use crate::key::ext::{AddressExt, ExtType, LifetimeExt};
use crate::key::message::IpsecProtocol;
use crate::key::parse::Envelope;
use crate::key::policy::{Level, Mode, PolicyKind};
use crate::output::formatting::{format_limit, level_name, policy_dir_name, policy_kind_name};
use crate::output::{OutputOptions, Printable};
use crate::util::addr::format_selector;

/// One IPsec request of a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub protocol: IpsecProtocol,
    pub mode: Mode,
    pub level: Level,
    pub reqid: u16,
    pub proxy: Option<IpAddr>,
}

impl RequestRecord {
    /// setkey-style `proto/mode/proxy/level`.
    fn spec(&self) -> String {
        let proxy = self.proxy.map(|p| p.to_string()).unwrap_or_default();
        let level = if self.reqid != 0 {
            format!("{}:{}", level_name(self.level), self.reqid)
        } else {
            level_name(self.level).to_string()
        };
        format!("{}/{}/{}/{}", self.protocol, self.mode, proxy, level)
    }
}

/// The parts of an SPD Get or Dump reply worth showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRecord {
    pub id: u32,
    pub dir: u8,
    pub kind: PolicyKind,
    pub src: AddressExt,
    pub dst: AddressExt,
    pub requests: Vec<RequestRecord>,
    pub current: Option<LifetimeExt>,
    pub hard: Option<LifetimeExt>,
}

impl PolicyRecord {
    /// Lift a policy out of a message. `None` when the policy or an
    /// address extension is missing.
    pub fn from_envelope(env: &Envelope) -> Option<Self> {
        let policy = env.exts.policy()?;
        Some(Self {
            id: policy.id,
            dir: policy.dir,
            kind: policy.kind,
            src: *env.exts.src()?,
            dst: *env.exts.dst()?,
            requests: policy
                .requests
                .iter()
                .map(|r| RequestRecord {
                    protocol: r.protocol,
                    mode: r.mode,
                    level: r.level,
                    reqid: r.reqid,
                    proxy: r.proxy,
                })
                .collect(),
            current: env.exts.lifetime(ExtType::LifetimeCurrent).copied(),
            hard: env.exts.lifetime(ExtType::LifetimeHard).copied(),
        })
    }

    fn upper_proto(&self) -> String {
        match self.src.proto {
            0 => "any".to_string(),
            p => p.to_string(),
        }
    }
}

impl Printable for PolicyRecord {
    fn print_text<W: Write>(&self, w: &mut W, opts: &OutputOptions) -> std::io::Result<()> {
        writeln!(
            w,
            "{} {} {}",
            format_selector(&self.src.addr, self.src.prefix, self.src.port),
            format_selector(&self.dst.addr, self.dst.prefix, self.dst.port),
            self.upper_proto()
        )?;
        writeln!(w, "\t{} {}", policy_dir_name(self.dir), policy_kind_name(self.kind))?;
        for req in &self.requests {
            writeln!(w, "\t{}", req.spec())?;
        }

        if opts.details {
            if let Some(cur) = &self.current {
                writeln!(w, "\tcreated: {} lastused: {}", cur.add_time, cur.use_time)?;
            }
            if let Some(hard) = &self.hard {
                writeln!(
                    w,
                    "\tlifetime: {} validtime: {}",
                    format_limit(hard.add_time),
                    format_limit(hard.use_time)
                )?;
            }
        }
        writeln!(w, "\tspid={}", self.id)?;
        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        let requests: Vec<_> = self
            .requests
            .iter()
            .map(|r| {
                let mut obj = serde_json::json!({
                    "protocol": r.protocol.to_string(),
                    "mode": r.mode.to_string(),
                    "level": level_name(r.level),
                    "reqid": r.reqid,
                });
                if let Some(proxy) = r.proxy {
                    obj["proxy"] = serde_json::json!(proxy.to_string());
                }
                obj
            })
            .collect();

        let mut obj = serde_json::json!({
            "id": self.id,
            "dir": policy_dir_name(self.dir),
            "action": policy_kind_name(self.kind),
            "src": format_selector(&self.src.addr, self.src.prefix, self.src.port),
            "dst": format_selector(&self.dst.addr, self.dst.prefix, self.dst.port),
            "proto": self.src.proto,
            "requests": requests,
        });
        if let Some(cur) = &self.current {
            obj["current"] = lifetime_json(cur);
        }
        if let Some(hard) = &self.hard {
            obj["hard"] = lifetime_json(hard);
        }

        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::builder::MessageBuilder;
    use crate::key::ext::{PolicyExt, policy_dir};
    use crate::key::message::{MessageType, satype};
    use crate::key::parse::check_envelope;
    use crate::key::policy::RequestSpec;
    use crate::output::{OutputFormat, print_all};

    fn record() -> PolicyRecord {
        let mut ext = PolicyExt::new(PolicyKind::Ipsec);
        ext.id = 7;
        ext.dir = policy_dir::OUTBOUND;
        ext.requests = vec![
            RequestSpec::tunnel(IpsecProtocol::Esp, "203.0.113.9".parse().unwrap()),
            RequestSpec::transport(IpsecProtocol::Ah).level(Level::Use),
        ];
        let mut b = MessageBuilder::new(MessageType::PolicyDump, satype::UNSPEC);
        b.address(
            ExtType::AddressSrc,
            AddressExt {
                proto: 0,
                prefix: 24,
                addr: "10.1.0.0".parse().unwrap(),
                port: 0,
            },
        )
        .address(
            ExtType::AddressDst,
            AddressExt {
                proto: 0,
                prefix: 24,
                addr: "10.2.0.0".parse().unwrap(),
                port: 500,
            },
        )
        .policy(ext);
        PolicyRecord::from_envelope(&check_envelope(&b.finish()).unwrap()).unwrap()
    }

    #[test]
    fn test_policy_text() {
        let mut out = Vec::new();
        record().print_text(&mut out, &OutputOptions::default()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("10.1.0.0/24 10.2.0.0/24[500] any\n"));
        assert!(text.contains("\tout ipsec\n"));
        assert!(text.contains("\tesp/tunnel/203.0.113.9/require\n"));
        assert!(text.contains("\tah/transport//use\n"));
        assert!(text.contains("spid=7"));
    }

    #[test]
    fn test_policy_list_json() {
        let mut out = Vec::new();
        print_all(
            &mut out,
            &[record(), record()],
            OutputFormat::Json,
            &OutputOptions::default(),
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let list = json.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["action"], "ipsec");
        assert_eq!(list[0]["requests"][0]["proxy"], "203.0.113.9");
        assert_eq!(list[0]["requests"][1]["level"], "use");
    }
}
