//! Admin commands: a PF_KEY client of the daemon socket.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use pfkey::key::{
    AddressExt, Envelope, ExtType, IpsecProtocol, LifetimeExt, MessageBuilder, MessageType,
    PolicyExt, PolicyKind, RequestSpec, check_envelope, satype,
};
use pfkey::output::formatting::{auth_name, comp_name, enc_name, satype_name};
use pfkey::output::{OutputFormat, OutputOptions, PolicyRecord, Printable, SaRecord, print_all};
use pfkey::util::parse_selector;
use tokio::net::UnixDatagram;

use crate::{ActionArg, SaTypeArg};

/// How long to wait for the daemon to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

struct Client {
    socket: UnixDatagram,
    path: PathBuf,
    buf: Vec<u8>,
}

impl Client {
    async fn connect(server: &Path) -> anyhow::Result<Self> {
        let path = std::env::temp_dir().join(format!("keyd-client-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)
            .with_context(|| format!("binding {}", path.display()))?;
        socket
            .connect(server)
            .with_context(|| format!("connecting to {}", server.display()))?;
        Ok(Self {
            socket,
            path,
            buf: vec![0u8; 65536],
        })
    }

    async fn send(&self, msg: Bytes) -> anyhow::Result<()> {
        self.socket.send(&msg).await.context("sending request")?;
        Ok(())
    }

    /// Next message from the daemon, or `None` on timeout.
    async fn recv(&mut self, timeout: Option<Duration>) -> anyhow::Result<Option<Envelope>> {
        let n = match timeout {
            Some(t) => match tokio::time::timeout(t, self.socket.recv(&mut self.buf)).await {
                Ok(r) => r?,
                Err(_) => return Ok(None),
            },
            None => self.socket.recv(&mut self.buf).await?,
        };
        Ok(Some(check_envelope(&self.buf[..n])?))
    }

    /// Wait for the reply to `kind`, skipping unrelated broadcasts.
    async fn reply(&mut self, kind: MessageType) -> anyhow::Result<Envelope> {
        loop {
            let Some(env) = self.recv(Some(REPLY_TIMEOUT)).await? else {
                bail!("no reply from the daemon");
            };
            if env.kind == kind {
                return Ok(env);
            }
        }
    }

    /// Send a request and check the errno of its reply.
    async fn call(&mut self, msg: Bytes, kind: MessageType) -> anyhow::Result<Envelope> {
        self.send(msg).await?;
        let env = self.reply(kind).await?;
        if env.header.errno != 0 {
            return Err(pfkey::Error::from_errno(i32::from(env.header.errno)).into());
        }
        Ok(env)
    }

    /// Collect dump replies until the one with sequence number zero.
    async fn dump(&mut self, msg: Bytes, kind: MessageType) -> anyhow::Result<Vec<Envelope>> {
        self.send(msg).await?;
        let mut out = Vec::new();
        loop {
            let env = self.reply(kind).await?;
            if i32::from(env.header.errno) == libc::ENOENT {
                break;
            }
            if env.header.errno != 0 {
                return Err(pfkey::Error::from_errno(i32::from(env.header.errno)).into());
            }
            let last = env.seq() == 0;
            out.push(env);
            if last {
                break;
            }
        }
        Ok(out)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn satype_or_unspec(arg: Option<SaTypeArg>) -> u8 {
    arg.map(SaTypeArg::number).unwrap_or(satype::UNSPEC)
}

pub async fn flush(server: &Path, arg: Option<SaTypeArg>) -> anyhow::Result<()> {
    let mut client = Client::connect(server).await?;
    let msg = MessageBuilder::new(MessageType::Flush, satype_or_unspec(arg)).finish();
    client.call(msg, MessageType::Flush).await?;
    Ok(())
}

pub async fn dump(
    server: &Path,
    arg: Option<SaTypeArg>,
    format: OutputFormat,
    opts: &OutputOptions,
) -> anyhow::Result<()> {
    let mut client = Client::connect(server).await?;
    let msg = MessageBuilder::new(MessageType::Dump, satype_or_unspec(arg)).finish();
    let records: Vec<_> = client
        .dump(msg, MessageType::Dump)
        .await?
        .iter()
        .filter_map(SaRecord::from_envelope)
        .collect();

    let mut stdout = io::stdout().lock();
    print_all(&mut stdout, &records, format, opts)?;
    Ok(())
}

pub async fn spd_flush(server: &Path) -> anyhow::Result<()> {
    let mut client = Client::connect(server).await?;
    let msg = MessageBuilder::new(MessageType::PolicyFlush, satype::UNSPEC).finish();
    client.call(msg, MessageType::PolicyFlush).await?;
    Ok(())
}

pub async fn spd_dump(
    server: &Path,
    format: OutputFormat,
    opts: &OutputOptions,
) -> anyhow::Result<()> {
    let mut client = Client::connect(server).await?;
    let msg = MessageBuilder::new(MessageType::PolicyDump, satype::UNSPEC).finish();
    let records: Vec<_> = client
        .dump(msg, MessageType::PolicyDump)
        .await?
        .iter()
        .filter_map(PolicyRecord::from_envelope)
        .collect();

    let mut stdout = io::stdout().lock();
    print_all(&mut stdout, &records, format, opts)?;
    Ok(())
}

fn selector(s: &str, proto: u8) -> anyhow::Result<AddressExt> {
    let (addr, prefix, port) = parse_selector(s).with_context(|| format!("selector {s}"))?;
    Ok(AddressExt {
        proto,
        prefix,
        addr,
        port,
    })
}

pub async fn spd_add(
    server: &Path,
    src: &str,
    dst: &str,
    proto: u8,
    action: ActionArg,
    lifetime: Option<u64>,
) -> anyhow::Result<()> {
    let policy = match action {
        ActionArg::Discard => PolicyExt::new(PolicyKind::Discard),
        ActionArg::None => PolicyExt::new(PolicyKind::None),
        ActionArg::EspTransport | ActionArg::AhTransport => {
            let protocol = if action == ActionArg::EspTransport {
                IpsecProtocol::Esp
            } else {
                IpsecProtocol::Ah
            };
            let mut ext = PolicyExt::new(PolicyKind::Ipsec);
            ext.requests.push(RequestSpec::transport(protocol));
            ext
        }
    };

    let mut b = MessageBuilder::new(MessageType::PolicyAdd, satype::UNSPEC);
    b.address(ExtType::AddressSrc, selector(src, proto)?)
        .address(ExtType::AddressDst, selector(dst, proto)?)
        .policy(policy);
    if let Some(secs) = lifetime {
        b.lifetime(
            ExtType::LifetimeHard,
            LifetimeExt {
                add_time: secs,
                ..Default::default()
            },
        );
    }

    let mut client = Client::connect(server).await?;
    let reply = client.call(b.finish(), MessageType::PolicyAdd).await?;
    if let Some(p) = reply.exts.policy() {
        println!("spid={}", p.id);
    }
    Ok(())
}

fn print_catalogue<W: Write>(w: &mut W, env: &Envelope) -> io::Result<()> {
    if let Some(algs) = env.exts.supported(ExtType::SupportedAuth) {
        for a in algs {
            writeln!(w, "auth {} {}-{} bits", auth_name(a.id), a.min_bits, a.max_bits)?;
        }
    }
    if let Some(algs) = env.exts.supported(ExtType::SupportedEncrypt) {
        let name = if env.satype() == satype::IPCOMP {
            comp_name
        } else {
            enc_name
        };
        for a in algs {
            writeln!(w, "encrypt {} {}-{} bits", name(a.id), a.min_bits, a.max_bits)?;
        }
    }
    Ok(())
}

fn print_acquire<W: Write>(w: &mut W, env: &Envelope, format: OutputFormat) -> io::Result<()> {
    let src = env.exts.src().map(|a| a.addr.to_string()).unwrap_or_default();
    let dst = env.exts.dst().map(|a| a.addr.to_string()).unwrap_or_default();
    let combs = env.exts.proposal().map(|p| p.combs.len()).unwrap_or(0);
    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "event": "acquire",
                "satype": satype_name(env.satype()),
                "seq": env.seq(),
                "src": src,
                "dst": dst,
                "proposals": combs,
            });
            writeln!(w, "{}", json)
        }
        OutputFormat::Text => writeln!(
            w,
            "acquire {} seq={} {} -> {} ({} proposals)",
            satype_name(env.satype()),
            env.seq(),
            src,
            dst,
            combs
        ),
    }
}

pub async fn register(
    server: &Path,
    arg: SaTypeArg,
    once: bool,
    format: OutputFormat,
    opts: &OutputOptions,
) -> anyhow::Result<()> {
    let mut client = Client::connect(server).await?;
    let msg = MessageBuilder::new(MessageType::Register, arg.number()).finish();
    let reply = client.call(msg, MessageType::Register).await?;
    print_catalogue(&mut io::stdout().lock(), &reply)?;
    if once {
        return Ok(());
    }

    loop {
        tokio::select! {
            received = client.recv(None) => {
                let Some(env) = received? else { continue };
                let mut stdout = io::stdout().lock();
                match env.kind {
                    MessageType::Acquire => print_acquire(&mut stdout, &env, format)?,
                    MessageType::Expire => {
                        if let Some(sa) = SaRecord::from_envelope(&env) {
                            write!(stdout, "expire ")?;
                            sa.print(&mut stdout, format, opts)?;
                        }
                    }
                    MessageType::PolicyExpire => {
                        if let Some(p) = PolicyRecord::from_envelope(&env) {
                            write!(stdout, "spdexpire ")?;
                            p.print(&mut stdout, format, opts)?;
                        }
                    }
                    _ => {}
                }
                stdout.flush()?;
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
