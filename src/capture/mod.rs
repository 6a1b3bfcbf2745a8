//! Raw capture seam.
//!
//! The tunnel reads and injects whole Ethernet frames through a
//! BPF-filtered capture handle. Real backends (libpcap and friends) live
//! behind the [`RawConn`] / [`RawConnProvider`] traits; the crate ships an
//! in-memory backend in [`mem`] for loopback runs and tests.

pub mod mem;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::wire::MacAddr;

/// A network device the capture handle is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: String,
    mac: MacAddr,
    addrs: Vec<Ipv4Addr>,
}

impl Device {
    /// Describe a device with one IPv4 address.
    pub fn new(name: impl Into<String>, mac: MacAddr, addr: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            mac,
            addrs: vec![addr],
        }
    }

    /// Describe a device with several IPv4 addresses.
    pub fn with_addrs(name: impl Into<String>, mac: MacAddr, addrs: Vec<Ipv4Addr>) -> Self {
        debug_assert!(!addrs.is_empty());
        Self {
            name: name.into(),
            mac,
            addrs,
        }
    }

    /// The device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device hardware address.
    pub fn hardware_addr(&self) -> MacAddr {
        self.mac
    }

    /// The device's primary IPv4 address.
    pub fn ip_addr(&self) -> Ipv4Addr {
        self.addrs[0]
    }

    /// All IPv4 addresses bound to the device.
    pub fn ip_addrs(&self) -> &[Ipv4Addr] {
        &self.addrs
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.ip_addr())
    }
}

/// The capture filters the tunnel installs, with their exact BPF
/// expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFilter {
    /// A client-side (or server per-client) data-plane capture: traffic
    /// from one remote endpoint to the local port, plus trailing IPv4
    /// fragments from the remote host.
    Client {
        /// Local port the remote sends to
        src_port: u16,
        /// The remote endpoint
        dst: SocketAddrV4,
    },
    /// The listener's handshake capture: inbound SYNs to the local port.
    Listener {
        /// Local port clients connect to
        src_port: u16,
    },
    /// The shared server data plane: all TCP to the local port.
    Multicast {
        /// Local port clients send to
        src_port: u16,
    },
}

impl CaptureFilter {
    /// Render the BPF filter expression for this capture.
    pub fn expression(&self) -> String {
        match self {
            CaptureFilter::Client { src_port, dst } => format!(
                "ip && ((tcp && dst port {} && src host {} && src port {}) || ((ip[6:2] & 0x1fff) != 0 && src host {}))",
                src_port,
                dst.ip(),
                dst.port(),
                dst.ip()
            ),
            CaptureFilter::Listener { src_port } => format!(
                "tcp && tcp[tcpflags] & tcp-syn != 0 && dst port {}",
                src_port
            ),
            CaptureFilter::Multicast { src_port } => format!("tcp && dst port {}", src_port),
        }
    }
}

impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

/// A raw, filtered, bidirectional frame pipe on a device pair.
///
/// Exactly one reader task per handle drains inbound frames; writers are
/// serialised by the connection above this seam.
#[async_trait]
pub trait RawConn: Send + Sync {
    /// Read the next captured frame.
    async fn read_packet(&self) -> Result<Bytes>;

    /// Inject one frame.
    async fn write(&self, frame: &[u8]) -> Result<usize>;

    /// Tear the capture down. Pending and future I/O observes a raw error.
    fn close(&self) -> Result<()>;

    /// The local device.
    fn local_dev(&self) -> &Device;

    /// The remote (gateway) device.
    fn remote_dev(&self) -> &Device;
}

/// Opens filtered captures; the factory behind dial, listen, and accept.
pub trait RawConnProvider: Send + Sync {
    /// Open a capture between `src` and `dst` with the given filter.
    fn open(&self, src: &Device, dst: &Device, filter: &CaptureFilter) -> Result<Arc<dyn RawConn>>;
}
