//! Per-remote-endpoint state.
//!
//! Every remote `ip:port` the connection speaks to gets a [`Peer`] record
//! carrying its cipher handle and the fake TCP sequence/acknowledgment
//! pair. Sequence state advances modulo 2³² and only ever moves forward,
//! except across an explicit wraparound.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::crypto::Crypt;

/// Fake TCP sequence state for one peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerState {
    /// Next sequence number to place on outbound segments
    pub tx_seq: u32,
    /// Expected acknowledgment for the peer
    pub rx_ack: u32,
}

impl PeerState {
    /// Advance the expected acknowledgment for an inbound data segment.
    ///
    /// The new value `seq + payload_len` is taken only when it moves the
    /// acknowledgment forward, or when the segment wraps the 32-bit
    /// sequence space.
    pub fn advance_rx_ack(&mut self, seq: u32, payload_len: u32) {
        let expected = seq.wrapping_add(payload_len);
        if expected > self.rx_ack || u32::MAX - seq < payload_len {
            self.rx_ack = expected;
        }
    }
}

/// A remote endpoint's record: cipher handle plus sequence state.
pub struct Peer {
    crypt: Crypt,
    state: Mutex<PeerState>,
}

impl Peer {
    /// Create a record with zeroed sequence state.
    pub fn new(crypt: Crypt) -> Self {
        Self {
            crypt,
            state: Mutex::new(PeerState::default()),
        }
    }

    /// The peer's cipher handle.
    pub fn crypt(&self) -> &Crypt {
        &self.crypt
    }

    /// Lock and access the sequence state.
    pub fn state(&self) -> parking_lot::MutexGuard<'_, PeerState> {
        self.state.lock()
    }
}

/// Concurrent map from remote address to peer record.
///
/// Lookups take the lock shared; insertions take it exclusive.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<SocketAddrV4, Arc<Peer>>>,
}

impl PeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a peer.
    pub fn get(&self, addr: &SocketAddrV4) -> Option<Arc<Peer>> {
        self.peers.read().get(addr).cloned()
    }

    /// Look up a peer, creating a zeroed record on first contact.
    pub fn get_or_insert(&self, addr: SocketAddrV4, crypt: &Crypt) -> Arc<Peer> {
        if let Some(peer) = self.peers.read().get(&addr) {
            return Arc::clone(peer);
        }
        let mut peers = self.peers.write();
        Arc::clone(
            peers
                .entry(addr)
                .or_insert_with(|| Arc::new(Peer::new(crypt.clone()))),
        )
    }

    /// Install a record, replacing any existing one.
    pub fn insert(&self, addr: SocketAddrV4, peer: Arc<Peer>) {
        self.peers.write().insert(addr, peer);
    }

    /// Whether a record exists for `addr`.
    pub fn contains(&self, addr: &SocketAddrV4) -> bool {
        self.peers.read().contains_key(addr)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
