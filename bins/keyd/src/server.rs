//! Daemon: the key engine behind a Unix datagram socket.
//!
//! Every peer address is one key socket. Datagrams are fed to the manager
//! and replies are sent back to the peer's path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use bytes::Bytes;
use pfkey::key::{
    DefaultAlgorithms, KeyConfig, KeyManager, MonotonicClock, SadbState, Sink, SocketId,
    StaticAddresses, Validatable,
};
use pfkey::util::parse_prefix;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65536;

/// Sends replies to peers of the daemon socket.
struct DatagramSink {
    socket: Arc<UnixDatagram>,
    peers: Mutex<HashMap<SocketId, PathBuf>>,
    gone: mpsc::UnboundedSender<SocketId>,
}

impl DatagramSink {
    fn peers(&self) -> std::sync::MutexGuard<'_, HashMap<SocketId, PathBuf>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Sink for DatagramSink {
    fn deliver(&self, socket: SocketId, bytes: Bytes) -> pfkey::Result<()> {
        let Some(path) = self.peers().get(&socket).cloned() else {
            return Err(pfkey::Error::not_found(format!("peer of {socket}")));
        };
        match self.socket.try_send_to(&bytes, &path) {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ECONNREFUSED) | Some(libc::ENOENT)
                ) =>
            {
                // The peer went away; forget it.
                self.peers().remove(&socket);
                let _ = self.gone.send(socket);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<KeyConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<KeyConfig>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => KeyConfig::default(),
    };

    let result = config.validate();
    for w in &result.warnings {
        warn!("config: {}", w);
    }
    if !result.is_valid() {
        for e in &result.errors {
            eprintln!("config: {}", e);
        }
        bail!("invalid configuration");
    }
    Ok(config)
}

/// Run the daemon until interrupted.
pub async fn serve(path: &Path, config: Option<&Path>, my_addrs: &[String]) -> anyhow::Result<()> {
    let config = load_config(config)?;

    let mut oracle = StaticAddresses::new();
    for cidr in my_addrs {
        let (addr, prefix) = parse_prefix(cidr).with_context(|| format!("--my-addr {cidr}"))?;
        oracle = oracle.with(addr, prefix);
    }

    // A stale socket file from an earlier run blocks bind.
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
    }
    let socket =
        Arc::new(UnixDatagram::bind(path).with_context(|| format!("binding {}", path.display()))?);
    info!(path = %path.display(), "listening");

    let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(DatagramSink {
        socket: socket.clone(),
        peers: Mutex::new(HashMap::new()),
        gone: gone_tx,
    });

    let state = SadbState::new(config, Arc::new(oracle), Arc::new(DefaultAlgorithms));
    let (handle, task) = KeyManager::new(state, sink.clone(), MonotonicClock::new()).spawn();

    let mut ids: HashMap<PathBuf, SocketId> = HashMap::new();
    let mut next_id = 1u64;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = received.context("receiving")?;
                let Some(peer_path) = peer.as_pathname() else {
                    debug!("dropping datagram from an unnamed peer");
                    continue;
                };
                let id = match ids.get(peer_path) {
                    Some(id) => *id,
                    None => {
                        let id = SocketId(next_id);
                        next_id += 1;
                        ids.insert(peer_path.to_path_buf(), id);
                        sink.peers().insert(id, peer_path.to_path_buf());
                        handle.open_socket(id).await?;
                        debug!(%id, peer = %peer_path.display(), "new peer");
                        id
                    }
                };
                handle.send(id, buf[..n].to_vec()).await?;
            }
            Some(id) = gone_rx.recv() => {
                ids.retain(|_, v| *v != id);
                handle.close_socket(id).await?;
                debug!(%id, "peer gone");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    handle.shutdown().await?;
    task.await.context("manager task")?;
    let _ = std::fs::remove_file(path);
    Ok(())
}
