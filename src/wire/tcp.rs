//! TCP transport-layer header, as forged by the tunnel.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::wire::checksum;
use crate::wire::ipv4::PROTOCOL_TCP;

/// TCP header length in bytes (the tunnel never emits options).
pub const HEADER_LEN: usize = 20;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;

/// A TCP header.
///
/// Freshly built headers default to `PSH|ACK` with a full window, the
/// shape of an ordinary data segment; [`TcpHeader::set_flags`] rewrites
/// them into handshake segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// SYN flag
    pub syn: bool,
    /// FIN flag
    pub fin: bool,
    /// RST flag
    pub rst: bool,
    /// PSH flag
    pub psh: bool,
    /// ACK flag
    pub ack_flag: bool,
    /// Advertised window (never honoured by the tunnel)
    pub window: u16,
}

impl TcpHeader {
    /// Create a data-segment header.
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            syn: false,
            fin: false,
            rst: false,
            psh: true,
            ack_flag: true,
            window: 65535,
        }
    }

    /// Rewrite the control flags for a handshake segment.
    ///
    /// Handshake segments carry no data, so PSH is cleared.
    pub fn set_flags(&mut self, syn: bool, fin: bool, ack: bool) {
        self.syn = syn;
        self.fin = fin;
        self.ack_flag = ack;
        self.psh = false;
    }

    /// Encoded header length in bytes.
    pub fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn flags_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= FLAG_FIN;
        }
        if self.syn {
            flags |= FLAG_SYN;
        }
        if self.rst {
            flags |= FLAG_RST;
        }
        if self.psh {
            flags |= FLAG_PSH;
        }
        if self.ack_flag {
            flags |= FLAG_ACK;
        }
        flags
    }

    /// Append the encoded header to `buf`.
    ///
    /// The checksum covers the IPv4 pseudo-header, the header itself, and
    /// `payload`, which the caller appends separately.
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], buf: &mut BytesMut) {
        let mut hdr = [0u8; HEADER_LEN];
        hdr[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        hdr[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        hdr[4..8].copy_from_slice(&self.seq.to_be_bytes());
        hdr[8..12].copy_from_slice(&self.ack.to_be_bytes());
        hdr[12] = ((HEADER_LEN / 4) as u8) << 4;
        hdr[13] = self.flags_byte();
        hdr[14..16].copy_from_slice(&self.window.to_be_bytes());

        let segment_len = (HEADER_LEN + payload.len()) as u16;
        let mut sum = checksum::pseudo_header(src, dst, PROTOCOL_TCP, segment_len);
        sum = checksum::sum_words(&hdr, sum);
        sum = checksum::sum_words(payload, sum);
        hdr[16..18].copy_from_slice(&checksum::fold(sum).to_be_bytes());

        buf.put_slice(&hdr);
    }

    /// Decode a header from the front of `data`.
    ///
    /// Returns the header and its on-wire length (options included).
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_LEN {
            return Err(Error::Buffer {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let data_offset = usize::from(data[12] >> 4) * 4;
        if data_offset < HEADER_LEN || data.len() < data_offset {
            return Err(Error::parse(format!("bad TCP data offset {}", data_offset)));
        }
        let flags = data[13];
        Ok((
            Self {
                src_port: u16::from_be_bytes([data[0], data[1]]),
                dst_port: u16::from_be_bytes([data[2], data[3]]),
                seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                syn: flags & FLAG_SYN != 0,
                fin: flags & FLAG_FIN != 0,
                rst: flags & FLAG_RST != 0,
                psh: flags & FLAG_PSH != 0,
                ack_flag: flags & FLAG_ACK != 0,
                window: u16::from_be_bytes([data[14], data[15]]),
            },
            data_offset,
        ))
    }
}
