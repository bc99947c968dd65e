//! keyd - PF_KEY v2 key engine daemon and admin client.

mod client;
mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pfkey::key::satype;
use pfkey::output::{OutputFormat, OutputOptions};

/// Default path of the daemon's datagram socket.
const DEFAULT_SOCKET: &str = "/run/keyd.sock";

#[derive(Parser)]
#[command(name = "keyd", version, about = "PF_KEY v2 key engine")]
struct Cli {
    /// Path of the daemon socket.
    #[arg(short = 's', long, global = true, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Output JSON.
    #[arg(short = 'j', long, global = true)]
    json: bool,

    /// Pretty print JSON.
    #[arg(short = 'p', long, global = true)]
    pretty: bool,

    /// Show lifetimes and counters.
    #[arg(short = 'd', long, global = true)]
    details: bool,

    #[command(subcommand)]
    command: Command,
}

/// SA type names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SaTypeArg {
    Ah,
    Esp,
    Ipcomp,
}

impl SaTypeArg {
    pub fn number(self) -> u8 {
        match self {
            Self::Ah => satype::AH,
            Self::Esp => satype::ESP,
            Self::Ipcomp => satype::IPCOMP,
        }
    }
}

/// Policy actions accepted by `spd-add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ActionArg {
    /// Drop matching traffic.
    Discard,
    /// Pass matching traffic without IPsec.
    None,
    /// Require ESP in transport mode.
    EspTransport,
    /// Require AH in transport mode.
    AhTransport,
}

#[derive(Subcommand)]
enum Command {
    /// Run the key engine daemon.
    Serve {
        /// JSON file with engine settings.
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Local address in CIDR notation (repeatable).
        #[arg(long = "my-addr", value_name = "CIDR")]
        my_addr: Vec<String>,
    },

    /// Delete every SA, or every SA of one type.
    Flush {
        #[arg(long, value_enum)]
        satype: Option<SaTypeArg>,
    },

    /// List SAs.
    Dump {
        #[arg(long, value_enum)]
        satype: Option<SaTypeArg>,
    },

    /// Delete every security policy.
    SpdFlush,

    /// List security policies.
    SpdDump,

    /// Add a security policy.
    SpdAdd {
        /// Source selector, ADDR[/PREFIX][[PORT]].
        src: String,

        /// Destination selector, ADDR[/PREFIX][[PORT]].
        dst: String,

        /// Upper-layer protocol number (0 for any).
        #[arg(long, default_value_t = 0)]
        proto: u8,

        /// What to do with matching traffic.
        #[arg(long, value_enum)]
        action: ActionArg,

        /// Expire the policy this many seconds after creation.
        #[arg(long)]
        lifetime: Option<u64>,
    },

    /// Register for acquire and expire notifications and print them.
    Register {
        #[arg(long, value_enum)]
        satype: SaTypeArg,

        /// Exit after the registration reply.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let opts = OutputOptions {
        details: cli.details,
        pretty: cli.pretty,
    };

    let result = match cli.command {
        Command::Serve { config, my_addr } => {
            server::serve(&cli.socket, config.as_deref(), &my_addr).await
        }
        Command::Flush { satype } => client::flush(&cli.socket, satype).await,
        Command::Dump { satype } => client::dump(&cli.socket, satype, format, &opts).await,
        Command::SpdFlush => client::spd_flush(&cli.socket).await,
        Command::SpdDump => client::spd_dump(&cli.socket, format, &opts).await,
        Command::SpdAdd {
            src,
            dst,
            proto,
            action,
            lifetime,
        } => client::spd_add(&cli.socket, &src, &dst, proto, action, lifetime).await,
        Command::Register { satype, once } => {
            client::register(&cli.socket, satype, once, format, &opts).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
