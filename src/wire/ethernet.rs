//! Ethernet II link-layer header.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Ethernet header length in bytes.
pub const HEADER_LEN: usize = 14;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The broadcast address `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    /// Get the raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// An Ethernet II header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination hardware address
    pub dst: MacAddr,
    /// Source hardware address
    pub src: MacAddr,
    /// EtherType of the carried network layer
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Create a header carrying IPv4.
    pub fn ipv4(src: MacAddr, dst: MacAddr) -> Self {
        Self {
            dst,
            src,
            ethertype: ETHERTYPE_IPV4,
        }
    }

    /// Append the encoded header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.dst.octets());
        buf.put_slice(&self.src.octets());
        buf.put_u16(self.ethertype);
    }

    /// Decode a header from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Buffer {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        src.copy_from_slice(&data[6..12]);
        Ok(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype: u16::from_be_bytes([data[12], data[13]]),
        })
    }
}
