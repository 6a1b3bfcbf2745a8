//! UDP transport-layer header.
//!
//! The tunnel itself only forges TCP, but genuine UDP captures must still
//! parse so they can be delivered upward unchanged.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::wire::checksum;
use crate::wire::ipv4::PROTOCOL_UDP;

/// UDP header length in bytes.
pub const HEADER_LEN: usize = 8;

/// A UDP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
}

impl UdpHeader {
    /// Create a header.
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self { src_port, dst_port }
    }

    /// Encoded header length in bytes.
    pub fn header_len(&self) -> usize {
        HEADER_LEN
    }

    /// Append the encoded header to `buf`.
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], buf: &mut BytesMut) {
        let length = (HEADER_LEN + payload.len()) as u16;

        let mut hdr = [0u8; HEADER_LEN];
        hdr[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        hdr[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        hdr[4..6].copy_from_slice(&length.to_be_bytes());

        let mut sum = checksum::pseudo_header(src, dst, PROTOCOL_UDP, length);
        sum = checksum::sum_words(&hdr, sum);
        sum = checksum::sum_words(payload, sum);
        let mut cksum = checksum::fold(sum);
        if cksum == 0 {
            // Zero means "no checksum" on the wire
            cksum = 0xFFFF;
        }
        hdr[6..8].copy_from_slice(&cksum.to_be_bytes());

        buf.put_slice(&hdr);
    }

    /// Decode a header from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_LEN {
            return Err(Error::Buffer {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok((
            Self {
                src_port: u16::from_be_bytes([data[0], data[1]]),
                dst_port: u16::from_be_bytes([data[2], data[3]]),
            },
            HEADER_LEN,
        ))
    }
}
