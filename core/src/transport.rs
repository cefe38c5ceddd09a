//! Transport contract between the resource subsystem and the embedding I/O
//! layer
//!
//! The game's network stack supplies [`NetIo`]: a broadcast primitive plus
//! per-peer message and data connections. Control traffic (Discover,
//! Status, Derive, Request) flows over message connections; bulk Data
//! packets use the data connection.
//!
//! [`LoopbackHub`] is an in-process implementation used by tests and the
//! demo CLI: packets are encoded to bytes, queued per peer, and decoded on
//! drain, so the full wire codec is exercised end to end.

use crate::protocol::ResPacket;
use crate::wire::WireError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("connection to client {0} is closed")]
    Closed(u16),

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// One reference-counted connection to a peer.
pub trait Connection: Send + Sync {
    /// Client id of the remote peer
    fn client_id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Enqueue a packet; may block on connection flow control.
    fn send(&self, pkt: &ResPacket) -> Result<(), TransportError>;
}

/// The embedding I/O subsystem.
pub trait NetIo: Send + Sync {
    /// Send a packet to every connected peer. Returns false when nothing
    /// could be sent.
    fn broadcast_msg(&self, pkt: &ResPacket) -> bool;

    /// Control-traffic connection to a peer
    fn msg_connection(&self, client: u16) -> Option<Arc<dyn Connection>>;

    /// Bulk-data connection to a peer
    fn data_connection(&self, client: u16) -> Option<Arc<dyn Connection>>;
}

// ---------------------------------------------------------------------------
// Loopback hub
// ---------------------------------------------------------------------------

struct Peer {
    client: u16,
    open: bool,
    inbox: VecDeque<(u16, Vec<u8>)>,
}

struct HubState {
    peers: Vec<Peer>,
}

/// In-process packet switch connecting any number of local endpoints.
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState { peers: Vec::new() })),
        }
    }

    /// Register a peer and get its [`NetIo`] endpoint.
    pub fn endpoint(&self, client: u16) -> Arc<LoopbackIo> {
        let mut state = self.state.lock();
        if !state.peers.iter().any(|p| p.client == client) {
            state.peers.push(Peer {
                client,
                open: true,
                inbox: VecDeque::new(),
            });
        }
        Arc::new(LoopbackIo {
            local: client,
            state: Arc::clone(&self.state),
        })
    }

    /// Simulate a peer dropping off the network: its connections report
    /// closed and queued traffic to it is discarded.
    pub fn disconnect(&self, client: u16) {
        let mut state = self.state.lock();
        if let Some(peer) = state.peers.iter_mut().find(|p| p.client == client) {
            peer.open = false;
            peer.inbox.clear();
        }
    }

    pub fn reconnect(&self, client: u16) {
        let mut state = self.state.lock();
        if let Some(peer) = state.peers.iter_mut().find(|p| p.client == client) {
            peer.open = true;
        }
    }

    /// Take all packets queued for `client`, decoding them from wire form.
    /// Corrupt packets surface as errors so tests can assert on them.
    pub fn drain(&self, client: u16) -> Vec<(u16, Result<ResPacket, WireError>)> {
        let mut state = self.state.lock();
        let Some(peer) = state.peers.iter_mut().find(|p| p.client == client) else {
            return Vec::new();
        };
        peer.inbox
            .drain(..)
            .map(|(from, bytes)| (from, ResPacket::from_bytes(&bytes)))
            .collect()
    }

    pub fn pending(&self, client: u16) -> usize {
        let state = self.state.lock();
        state
            .peers
            .iter()
            .find(|p| p.client == client)
            .map_or(0, |p| p.inbox.len())
    }
}

/// One peer's view of the hub.
pub struct LoopbackIo {
    local: u16,
    state: Arc<Mutex<HubState>>,
}

impl LoopbackIo {
    fn connection(&self, client: u16) -> Option<Arc<dyn Connection>> {
        let state = self.state.lock();
        let peer = state.peers.iter().find(|p| p.client == client)?;
        if !peer.open {
            return None;
        }
        Some(Arc::new(LoopbackConn {
            local: self.local,
            remote: client,
            state: Arc::clone(&self.state),
        }))
    }
}

impl NetIo for LoopbackIo {
    fn broadcast_msg(&self, pkt: &ResPacket) -> bool {
        let bytes = pkt.to_bytes();
        let mut state = self.state.lock();
        let local = self.local;
        let mut sent = false;
        for peer in state.peers.iter_mut() {
            if peer.client != local && peer.open {
                peer.inbox.push_back((local, bytes.clone()));
                sent = true;
            }
        }
        sent
    }

    fn msg_connection(&self, client: u16) -> Option<Arc<dyn Connection>> {
        self.connection(client)
    }

    fn data_connection(&self, client: u16) -> Option<Arc<dyn Connection>> {
        self.connection(client)
    }
}

/// A loopback connection; delivery is a queue push.
pub struct LoopbackConn {
    local: u16,
    remote: u16,
    state: Arc<Mutex<HubState>>,
}

impl LoopbackConn {
    /// Connection from `from` as seen by a packet handler on the receiving
    /// side.
    pub fn inbound(hub: &LoopbackHub, from: u16, to: u16) -> Arc<dyn Connection> {
        Arc::new(LoopbackConn {
            local: to,
            remote: from,
            state: Arc::clone(&hub.state),
        })
    }
}

impl Connection for LoopbackConn {
    fn client_id(&self) -> u16 {
        self.remote
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state
            .peers
            .iter()
            .find(|p| p.client == self.remote)
            .is_some_and(|p| p.open)
    }

    fn send(&self, pkt: &ResPacket) -> Result<(), TransportError> {
        let bytes = pkt.to_bytes();
        let mut state = self.state.lock();
        let local = self.local;
        let peer = state
            .peers
            .iter_mut()
            .find(|p| p.client == self.remote)
            .ok_or(TransportError::Closed(self.remote))?;
        if !peer.open {
            return Err(TransportError::Closed(self.remote));
        }
        peer.inbox.push_back((local, bytes));
        Ok(())
    }
}
