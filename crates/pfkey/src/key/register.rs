//! Listener directory.
//!
//! Tracks open key sockets, which of them registered for an SA type, and
//! which asked to see every message (promiscuous mode).

use std::collections::BTreeSet;
use std::fmt;

use super::error::{Error, Result};

/// Identity of a key socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// A socket registered for one SA type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegisteredListener {
    pub socket: SocketId,
    pub satype: u8,
}

/// Open sockets, registrations, and the promiscuous set.
#[derive(Debug, Default)]
pub struct ListenerDirectory {
    open: BTreeSet<SocketId>,
    registered: BTreeSet<RegisteredListener>,
    promisc: BTreeSet<SocketId>,
}

impl ListenerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a socket. Opening a known socket is a no-op.
    pub fn open_socket(&mut self, socket: SocketId) {
        self.open.insert(socket);
    }

    /// Forget a socket with all its registrations.
    pub fn close_socket(&mut self, socket: SocketId) {
        self.open.remove(&socket);
        self.promisc.remove(&socket);
        self.registered.retain(|r| r.socket != socket);
    }

    pub fn is_open(&self, socket: SocketId) -> bool {
        self.open.contains(&socket)
    }

    /// Register `socket` for `satype`.
    pub fn register(&mut self, socket: SocketId, satype: u8) -> Result<()> {
        self.open.insert(socket);
        if !self.registered.insert(RegisteredListener { socket, satype }) {
            return Err(Error::exists(format!("{socket} registration for SA type {satype}")));
        }
        Ok(())
    }

    /// Sockets registered for `satype`.
    pub fn registered_for(&self, satype: u8) -> Vec<SocketId> {
        self.registered
            .iter()
            .filter(|r| r.satype == satype)
            .map(|r| r.socket)
            .collect()
    }

    /// Every open socket.
    pub fn all(&self) -> Vec<SocketId> {
        self.open.iter().copied().collect()
    }

    /// Turn promiscuous mode on or off for a socket.
    pub fn set_promisc(&mut self, socket: SocketId, on: bool) {
        self.open.insert(socket);
        if on {
            self.promisc.insert(socket);
        } else {
            self.promisc.remove(&socket);
        }
    }

    pub fn is_promisc(&self, socket: SocketId) -> bool {
        self.promisc.contains(&socket)
    }

    /// Sockets in promiscuous mode.
    pub fn promiscuous(&self) -> Vec<SocketId> {
        self.promisc.iter().copied().collect()
    }
}
