//! IPv4 fragmentation and reassembly.
//!
//! Outbound datagrams larger than the MTU are split into 8-byte-aligned
//! fragments by [`create_fragment_packets`]; captured fragments are
//! collected per flow and stitched back into whole datagrams by a
//! [`Defragmenter`]. Two reassemblers exist: the easy one tolerates the
//! non-conformant fragments this tunnel itself emits, the strict one
//! enforces RFC-shaped contiguity and overlap rules for well-formed
//! peers.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::wire::{self, EthernetHeader, Ipv4Header, PacketIndicator, TcpHeader};

/// Key identifying one fragment flow: datagram id plus source host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragFlow {
    id: u16,
    src: Ipv4Addr,
}

/// Accumulates the fragments of a single datagram.
#[derive(Debug)]
struct FragmentIndicator {
    /// Running sum of non-final fragment payload bytes
    length: u16,
    /// Offset of the final fragment in 8-byte units, 0 until seen
    offset: u16,
    /// Whether the final fragment (MF clear) has arrived
    saw_last: bool,
    /// Fragments sorted by ascending offset
    frags: Vec<PacketIndicator>,
    last_seen: Instant,
}

impl FragmentIndicator {
    fn new() -> Self {
        Self {
            length: 0,
            offset: 0,
            saw_last: false,
            frags: Vec::new(),
            last_seen: Instant::now(),
        }
    }

    fn append(&mut self, ind: PacketIndicator) {
        self.last_seen = Instant::now();

        if ind.more_fragments() {
            self.length += ind.network_payload().len() as u16;
        } else {
            self.offset = ind.frag_offset();
            self.saw_last = true;
        }

        self.frags.push(ind);
        if self.frags.len() > 1 {
            self.frags.sort_by_key(|f| f.frag_offset());
        }
    }

    fn is_completed(&self) -> bool {
        // The final fragment sits exactly where the accumulated
        // non-final bytes end
        self.saw_last && self.length / 8 == self.offset
    }

    fn concatenate(&self) -> Result<PacketIndicator> {
        if !self.is_completed() {
            return Err(Error::IncompleteFragments);
        }

        let first = &self.frags[0];
        let mut header = first.ipv4().clone();
        header.set_flags(false, false, 0);

        let mut contents = Vec::with_capacity(usize::from(self.offset) * 8 + 64);
        for frag in &self.frags {
            contents.extend_from_slice(frag.network_payload());
        }

        match first.link() {
            Some(link) => {
                let data = wire::serialize_frame(Some(link), &header, &contents);
                PacketIndicator::parse_frame(data)
            }
            None => {
                let data = wire::serialize_ip(&header, &contents);
                PacketIndicator::parse_packet(data)
            }
        }
    }
}

/// A machine that turns captured packets back into whole datagrams.
pub trait Defragmenter: Send {
    /// Add a captured packet.
    ///
    /// Whole packets come back unchanged. Fragments are retained per
    /// flow; the completed datagram is returned once every piece has
    /// arrived, in any order.
    fn append(&mut self, ind: PacketIndicator) -> Result<Option<PacketIndicator>>;

    /// Discard fragment flows idle for longer than `deadline`.
    /// A zero deadline keeps fragments forever.
    fn set_deadline(&mut self, deadline: Duration);
}

/// Reassembler that accepts any fragment, standards-conformant or not.
///
/// No overlap validation: the forged packets this tunnel emits may break
/// the RFC's overlap rules under upstream retransmission, and must still
/// reassemble.
#[derive(Default)]
pub struct EasyDefragmenter {
    frags: HashMap<FragFlow, FragmentIndicator>,
    deadline: Duration,
}

impl EasyDefragmenter {
    /// Create a reassembler with no eviction deadline.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Defragmenter for EasyDefragmenter {
    fn append(&mut self, ind: PacketIndicator) -> Result<Option<PacketIndicator>> {
        if !ind.is_frag() {
            return Ok(Some(ind));
        }

        let flow = FragFlow {
            id: ind.network_id(),
            src: ind.src_ip(),
        };
        let deadline = self.deadline;
        let indicator = self.frags.entry(flow).or_insert_with(FragmentIndicator::new);

        // Stale flows are replaced rather than extended
        if !deadline.is_zero() && indicator.last_seen.elapsed() > deadline {
            tracing::debug!("recycle fragments {} from {}", flow.id, flow.src);
            *indicator = FragmentIndicator::new();
        }

        indicator.append(ind);

        if !indicator.is_completed() {
            return Ok(None);
        }

        let indicator = self.frags.remove(&flow).expect("flow was just touched");
        Ok(Some(indicator.concatenate()?))
    }

    fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = deadline;
    }
}

/// Key for the strict reassembler: the full RFC 791 datagram identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StrictKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    protocol: u8,
}

struct StrictPart {
    offset: usize,
    payload: Bytes,
    more_fragments: bool,
}

struct StrictFlow {
    header: Ipv4Header,
    link: Option<EthernetHeader>,
    parts: Vec<StrictPart>,
    last_seen: Instant,
}

/// RFC-conformant reassembler: rejects overlapping fragments and only
/// completes contiguous datagrams.
#[derive(Default)]
pub struct StrictDefragmenter {
    flows: HashMap<StrictKey, StrictFlow>,
    deadline: Duration,
}

impl StrictDefragmenter {
    /// Create a reassembler with no eviction deadline.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Defragmenter for StrictDefragmenter {
    fn append(&mut self, ind: PacketIndicator) -> Result<Option<PacketIndicator>> {
        if !ind.is_frag() {
            return Ok(Some(ind));
        }

        // Expire idle flows before admitting anything new
        if !self.deadline.is_zero() {
            let deadline = self.deadline;
            self.flows.retain(|_, flow| flow.last_seen.elapsed() <= deadline);
        }

        let key = StrictKey {
            src: ind.src_ip(),
            dst: ind.dst_ip(),
            id: ind.network_id(),
            protocol: ind.ipv4().protocol,
        };
        let flow = self.flows.entry(key).or_insert_with(|| StrictFlow {
            header: ind.ipv4().clone(),
            link: ind.link().cloned(),
            parts: Vec::new(),
            last_seen: Instant::now(),
        });
        flow.last_seen = Instant::now();

        let offset = usize::from(ind.frag_offset()) * 8;
        let payload = Bytes::copy_from_slice(ind.network_payload());
        for part in &flow.parts {
            let overlaps = offset < part.offset + part.payload.len()
                && part.offset < offset + payload.len();
            if overlaps {
                return Err(Error::parse(format!(
                    "overlapping fragment at offset {} from {}",
                    offset, key.src
                )));
            }
        }

        // The first piece carries the authoritative header
        if ind.frag_offset() == 0 {
            flow.header = ind.ipv4().clone();
            flow.link = ind.link().cloned();
        }
        flow.parts.push(StrictPart {
            offset,
            payload,
            more_fragments: ind.more_fragments(),
        });
        flow.parts.sort_by_key(|part| part.offset);

        if !flow.parts.iter().any(|part| !part.more_fragments) {
            return Ok(None);
        }
        let mut expected = 0usize;
        for part in &flow.parts {
            if part.offset != expected {
                return Ok(None);
            }
            expected += part.payload.len();
        }

        let flow = self.flows.remove(&key).expect("flow was just touched");
        let mut header = flow.header;
        header.set_flags(false, false, 0);
        let mut contents = Vec::with_capacity(expected);
        for part in &flow.parts {
            contents.extend_from_slice(&part.payload);
        }

        let packet = match &flow.link {
            Some(link) => {
                let data = wire::serialize_frame(Some(link), &header, &contents);
                PacketIndicator::parse_frame(data)?
            }
            None => {
                let data = wire::serialize_ip(&header, &contents);
                PacketIndicator::parse_packet(data)?
            }
        };
        Ok(Some(packet))
    }

    fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = deadline;
    }
}

/// Split one outbound datagram into wire-ready frames honouring `mtu`.
///
/// The transport header rides on the first fragment only. Every fragment
/// except the last has a body length divisible by 8, and the last carries
/// at least 8 bytes.
pub fn create_fragment_packets(
    link: Option<&EthernetHeader>,
    network: &Ipv4Header,
    transport: Option<&TcpHeader>,
    payload: &[u8],
    mtu: usize,
) -> Result<Vec<Bytes>> {
    let net_header_len = network.header_len();
    if mtu < net_header_len + 8 {
        return Err(Error::Buffer {
            expected: net_header_len + 8,
            actual: mtu,
        });
    }

    let net_payload: Vec<u8> = match transport {
        Some(tcp) => {
            let mut buf = BytesMut::with_capacity(tcp.header_len() + payload.len());
            tcp.encode(network.src, network.dst, payload, &mut buf);
            buf.extend_from_slice(payload);
            buf.to_vec()
        }
        None => payload.to_vec(),
    };

    let mut frames = Vec::new();

    if net_header_len + net_payload.len() <= mtu {
        frames.push(wire::serialize_frame(link, network, &net_payload));
        return Ok(frames);
    }

    let mut header = network.clone();
    let mut i = 0usize;
    while i < net_payload.len() {
        let mut length = (mtu - net_header_len).min(net_payload.len() - i);
        let mut remain = net_payload.len() - i - length;

        // Non-final fragment bodies sit on 8-byte boundaries
        if remain > 0 {
            length = length / 8 * 8;
            remain = net_payload.len() - i - length;
        }

        // The tail fragment must carry at least 8 bytes
        if remain > 0 && remain < 8 {
            length -= 8;
            remain = net_payload.len() - i - length;
        }
        if length == 0 {
            return Err(Error::Buffer {
                expected: net_header_len + 16,
                actual: mtu,
            });
        }

        header.set_flags(false, remain > 0, (i / 8) as u16);
        frames.push(wire::serialize_frame(link, &header, &net_payload[i..i + length]));

        i += length;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{create_layers, ipv4, MacAddr};

    const SRC_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);
    const DST_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 2]);
    const SRC_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn layers(id: u16) -> (TcpHeader, Ipv4Header, EthernetHeader) {
        create_layers(40000, 50000, 1, 1, SRC_IP, DST_IP, id, 128, SRC_MAC, DST_MAC)
    }

    fn fragment(payload: &[u8], mtu: usize, id: u16) -> Vec<Bytes> {
        let (tcp, ip, eth) = layers(id);
        create_fragment_packets(Some(&eth), &ip, Some(&tcp), payload, mtu).unwrap()
    }

    #[test]
    fn test_small_payload_single_frame() {
        let frames = fragment(b"hello", 1500, 1);
        assert_eq!(frames.len(), 1);

        let ind = PacketIndicator::parse_frame(frames[0].clone()).unwrap();
        assert!(!ind.is_frag());
        assert_eq!(ind.app_payload(), b"hello");
    }

    #[test]
    fn test_fragment_alignment() {
        // MTU 60 with a 20-byte IP header leaves 40 bytes per fragment
        let payload = vec![0x5A; 200];
        let frames = fragment(&payload, 60, 2);
        assert!(frames.len() >= 4);

        for (n, frame) in frames.iter().enumerate() {
            let ind = PacketIndicator::parse_frame(frame.clone()).unwrap();
            let body = ind.network_payload().len();
            if n + 1 < frames.len() {
                assert!(ind.more_fragments());
                assert_eq!(body % 8, 0, "non-final fragment body must be 8-aligned");
            } else {
                assert!(!ind.more_fragments());
                assert!(body >= 8, "final fragment must carry at least 8 bytes");
                assert!(body <= 40);
            }
        }
    }

    #[test]
    fn test_minimum_tail_rule() {
        // 184 payload bytes + 20 TCP = 204 network bytes; 40-byte pieces
        // would leave a 4-byte tail, so the fifth piece shrinks to 32
        let payload = vec![1u8; 184];
        let (tcp, ip, eth) = layers(3);
        let frames = create_fragment_packets(Some(&eth), &ip, Some(&tcp), &payload, 60).unwrap();

        let bodies: Vec<usize> = frames
            .iter()
            .map(|f| {
                PacketIndicator::parse_frame(f.clone())
                    .unwrap()
                    .network_payload()
                    .len()
            })
            .collect();
        assert_eq!(bodies, vec![40, 40, 40, 40, 32, 12]);
    }

    #[test]
    fn test_mtu_too_small_rejected() {
        let (tcp, ip, eth) = layers(4);
        let result = create_fragment_packets(Some(&eth), &ip, Some(&tcp), &[0u8; 64], 20);
        assert!(matches!(result, Err(Error::Buffer { .. })));
    }

    #[test]
    fn test_round_trip_in_order() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(500).collect();
        let frames = fragment(&payload, 100, 5);
        assert!(frames.len() > 1);

        let mut defrag = EasyDefragmenter::new();
        let mut result = None;
        for frame in frames {
            let ind = PacketIndicator::parse_frame(frame).unwrap();
            if let Some(whole) = defrag.append(ind).unwrap() {
                result = Some(whole);
            }
        }

        let whole = result.expect("reassembly must complete");
        assert!(!whole.is_frag());
        assert_eq!(whole.app_payload(), &payload[..]);
        assert_eq!(whole.tcp().unwrap().src_port, 40000);
    }

    #[test]
    fn test_round_trip_reversed() {
        let payload = vec![0xC3; 200];
        let frames = fragment(&payload, 60, 6);

        let mut defrag = EasyDefragmenter::new();
        let mut delivered = Vec::new();
        for frame in frames.iter().rev() {
            let ind = PacketIndicator::parse_frame(frame.clone()).unwrap();
            if let Some(whole) = defrag.append(ind).unwrap() {
                delivered.push(whole);
            }
        }

        assert_eq!(delivered.len(), 1, "exactly one datagram must come out");
        assert_eq!(delivered[0].app_payload(), &payload[..]);
    }

    #[test]
    fn test_round_trip_shuffled() {
        let payload: Vec<u8> = (0..180u8).collect();
        let frames = fragment(&payload, 60, 7);
        assert!(frames.len() >= 3);

        // Rotate so the middle fragment leads
        let mut order: Vec<_> = frames.iter().cloned().collect();
        order.rotate_left(frames.len() / 2);

        let mut defrag = EasyDefragmenter::new();
        let mut result = None;
        for frame in order {
            let ind = PacketIndicator::parse_frame(frame).unwrap();
            if let Some(whole) = defrag.append(ind).unwrap() {
                result = Some(whole);
            }
        }
        assert_eq!(result.unwrap().app_payload(), &payload[..]);
    }

    #[test]
    fn test_whole_packet_passes_through() {
        let frames = fragment(b"tiny", 1500, 8);
        let ind = PacketIndicator::parse_frame(frames[0].clone()).unwrap();

        let mut defrag = EasyDefragmenter::new();
        let out = defrag.append(ind).unwrap().expect("whole packet returned");
        assert_eq!(out.app_payload(), b"tiny");
    }

    #[test]
    fn test_incomplete_returns_none() {
        let frames = fragment(&[0u8; 200], 60, 9);
        let mut defrag = EasyDefragmenter::new();

        // Everything except the last fragment
        for frame in &frames[..frames.len() - 1] {
            let ind = PacketIndicator::parse_frame(frame.clone()).unwrap();
            assert!(defrag.append(ind).unwrap().is_none());
        }
    }

    #[test]
    fn test_stale_flow_recycled() {
        let frames = fragment(&[0u8; 200], 60, 10);
        let mut defrag = EasyDefragmenter::new();
        defrag.set_deadline(Duration::from_millis(10));

        // Seed with one fragment, let it go stale
        let ind = PacketIndicator::parse_frame(frames[0].clone()).unwrap();
        assert!(defrag.append(ind).unwrap().is_none());
        std::thread::sleep(Duration::from_millis(30));

        // Replay every fragment: the stale piece is discarded first, so
        // the replayed set still completes on its own
        let mut result = None;
        for frame in &frames {
            let ind = PacketIndicator::parse_frame(frame.clone()).unwrap();
            if let Some(whole) = defrag.append(ind).unwrap() {
                result = Some(whole);
            }
        }
        assert!(result.is_some());
    }

    #[test]
    fn test_flows_kept_separate() {
        let a = fragment(&[0xAA; 120], 60, 21);
        let b = fragment(&[0xBB; 120], 60, 22);

        let mut defrag = EasyDefragmenter::new();
        let mut out = Vec::new();
        // Interleave two flows
        for (fa, fb) in a.iter().zip(&b) {
            for frame in [fa, fb] {
                let ind = PacketIndicator::parse_frame(frame.clone()).unwrap();
                if let Some(whole) = defrag.append(ind).unwrap() {
                    out.push(whole);
                }
            }
        }
        assert_eq!(out.len(), 2);
        let mut ids: Vec<_> = out.iter().map(|p| p.network_id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![21, 22]);
    }

    #[test]
    fn test_strict_round_trip() {
        let payload = vec![0x7E; 200];
        let frames = fragment(&payload, 60, 11);

        let mut defrag = StrictDefragmenter::new();
        let mut result = None;
        for frame in frames.iter().rev() {
            let ind = PacketIndicator::parse_frame(frame.clone()).unwrap();
            if let Some(whole) = defrag.append(ind).unwrap() {
                result = Some(whole);
            }
        }
        assert_eq!(result.unwrap().app_payload(), &payload[..]);
    }

    #[test]
    fn test_strict_rejects_overlap() {
        let frames = fragment(&[0u8; 200], 60, 12);
        let mut defrag = StrictDefragmenter::new();

        let first = PacketIndicator::parse_frame(frames[0].clone()).unwrap();
        assert!(defrag.append(first.clone()).unwrap().is_none());
        assert!(defrag.append(first).is_err(), "duplicate piece must be rejected");
    }

    #[test]
    fn test_strict_passes_whole_packets() {
        let frames = fragment(b"whole", 1500, 13);
        let ind = PacketIndicator::parse_frame(frames[0].clone()).unwrap();

        let mut defrag = StrictDefragmenter::new();
        let out = defrag.append(ind).unwrap().unwrap();
        assert_eq!(out.app_payload(), b"whole");
    }

    #[test]
    fn test_fragments_without_link_layer() {
        let (tcp, ip, _eth) = layers(14);
        let payload = vec![9u8; 200];
        let frames = create_fragment_packets(None, &ip, Some(&tcp), &payload, 60).unwrap();

        let mut defrag = EasyDefragmenter::new();
        let mut result = None;
        for frame in frames {
            let ind = PacketIndicator::parse_packet(frame).unwrap();
            assert!(ind.link().is_none());
            if let Some(whole) = defrag.append(ind).unwrap() {
                result = Some(whole);
            }
        }
        assert_eq!(result.unwrap().app_payload(), &payload[..]);
    }

    #[test]
    fn test_reassembled_header_is_whole() {
        let frames = fragment(&[3u8; 200], 60, 15);
        let mut defrag = EasyDefragmenter::new();
        let mut result = None;
        for frame in frames {
            let ind = PacketIndicator::parse_frame(frame).unwrap();
            if let Some(whole) = defrag.append(ind).unwrap() {
                result = Some(whole);
            }
        }
        let whole = result.unwrap();
        assert!(!whole.ipv4().more_fragments);
        assert_eq!(whole.ipv4().fragment_offset, 0);
        assert_eq!(whole.ipv4().protocol, ipv4::PROTOCOL_TCP);
    }
}
