//! # camoflow
//!
//! A packet-forging tunnel transport: arbitrary payloads cross a hostile
//! network disguised as ordinary TCP flows, injected and captured at the
//! link layer instead of through the host TCP/IP stack.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Reliable datagram layer (external, e.g. KCP)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection / Listener (fake handshake, peers, seq/ack) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Cipher (per-peer ChaCha20-Poly1305 or passthrough)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Fragmenter / Defragmenter (MTU, 8-byte alignment)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Wire codecs (Ethernet, IPv4, TCP/UDP, checksums)       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Raw capture seam (BPF-filtered frame pipe)             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The wire carries the full TCP ceremony — SYN, SYN+ACK, ACK, plausible
//! sequence and acknowledgment numbers — but none of TCP's semantics: no
//! windows, no retransmission, no ordering, no teardown. Camouflage only;
//! reliability belongs to whatever stacks on top, which is why inbound
//! traffic is reported with UDP-form addresses.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod capture;
pub mod config;
pub mod crypto;
pub mod error;
pub mod tunnel;
pub mod wire;

pub use error::{Error, Op, Result};
pub use tunnel::{AcceptOutcome, Connection, Listener};
pub use wire::TransportAddr;
