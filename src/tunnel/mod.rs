//! The tunnel transport core.
//!
//! Stacks, bottom to top:
//!
//! 1. [`fragment`] — IPv4 fragmentation against the MTU and per-flow
//!    reassembly of captured fragments.
//! 2. [`peer`] — per-remote-endpoint cipher and sequence state.
//! 3. [`conn`] — the connection object: fake handshake, read/write,
//!    deadlines, close.
//! 4. [`listener`] — passive SYN intake spawning per-client connections.

pub mod conn;
pub mod fragment;
pub mod listener;
pub mod peer;

pub use conn::Connection;
pub use fragment::{create_fragment_packets, Defragmenter, EasyDefragmenter, StrictDefragmenter};
pub use listener::{AcceptOutcome, Listener};
pub use peer::{Peer, PeerState, PeerTable};

use std::time::Duration;

/// Window after a SYN within which the reply is expected before the
/// "server seems down" diagnostic fires.
pub const ESTABLISH_DEADLINE: Duration = Duration::from_secs(3);

/// Default eviction deadline for partially reassembled fragments.
pub const KEEP_FRAGMENTS: Duration = Duration::from_secs(30);

/// Largest MTU the tunnel fragments against.
pub const MAX_MTU: usize = 1500;
