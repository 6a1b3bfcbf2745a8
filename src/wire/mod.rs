//! Wire formats for the forged packet stack.
//!
//! Header codecs for the three layers the tunnel speaks (Ethernet II,
//! IPv4, TCP) plus UDP for genuine datagram captures. Everything encodes
//! into [`bytes`] buffers with checksums and length fields computed at
//! serialisation time, and parses back into a [`PacketIndicator`] with
//! typed accessors per layer.

mod checksum;
pub mod ethernet;
mod indicator;
pub mod ipv4;
pub mod tcp;
pub mod udp;

pub use ethernet::{EthernetHeader, MacAddr, ETHERTYPE_IPV4};
pub use indicator::{PacketIndicator, TransportAddr, TransportLayer};
pub use ipv4::Ipv4Header;
pub use tcp::TcpHeader;
pub use udp::UdpHeader;

use std::net::Ipv4Addr;

use bytes::{Bytes, BytesMut};

/// Build the transport, network, and link headers for one outbound
/// segment of the fake flow.
///
/// The TCP header carries data-segment flags; callers rewrite them with
/// [`TcpHeader::set_flags`] for handshake segments.
#[allow(clippy::too_many_arguments)]
pub fn create_layers(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    ip_id: u16,
    ttl: u8,
    src_mac: MacAddr,
    dst_mac: MacAddr,
) -> (TcpHeader, Ipv4Header, EthernetHeader) {
    let transport = TcpHeader::new(src_port, dst_port, seq, ack);
    let network = Ipv4Header::new(src_ip, dst_ip, ipv4::PROTOCOL_TCP, ip_id, ttl);
    let link = EthernetHeader::ipv4(src_mac, dst_mac);
    (transport, network, link)
}

/// Serialise an IPv4 datagram: header (lengths and checksum computed)
/// followed by `payload`.
pub fn serialize_ip(network: &Ipv4Header, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(network.header_len() + payload.len());
    network.encode(payload.len(), &mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Serialise a wire frame: optional link header, IPv4 header, payload.
pub fn serialize_frame(link: Option<&EthernetHeader>, network: &Ipv4Header, payload: &[u8]) -> Bytes {
    let link_len = if link.is_some() { ethernet::HEADER_LEN } else { 0 };
    let mut buf = BytesMut::with_capacity(link_len + network.header_len() + payload.len());
    if let Some(link) = link {
        link.encode(&mut buf);
    }
    network.encode(payload.len(), &mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_layers_shapes() {
        let (tcp, ip, eth) = create_layers(
            19999,
            20000,
            1,
            101,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            42,
            128,
            MacAddr([2, 0, 0, 0, 0, 1]),
            MacAddr([2, 0, 0, 0, 0, 2]),
        );

        assert_eq!(tcp.src_port, 19999);
        assert_eq!(tcp.dst_port, 20000);
        assert_eq!(tcp.seq, 1);
        assert_eq!(tcp.ack, 101);
        assert_eq!(ip.protocol, ipv4::PROTOCOL_TCP);
        assert_eq!(ip.identification, 42);
        assert_eq!(ip.ttl, 128);
        assert_eq!(eth.ethertype, ETHERTYPE_IPV4);
    }

    #[test]
    fn test_serialize_ip_layout() {
        let ip = Ipv4Header::new(
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(5, 6, 7, 8),
            ipv4::PROTOCOL_UDP,
            7,
            64,
        );
        let packet = serialize_ip(&ip, b"abcd");
        assert_eq!(packet.len(), ipv4::HEADER_LEN + 4);
        assert_eq!(&packet[ipv4::HEADER_LEN..], b"abcd");
    }

    #[test]
    fn test_serialize_frame_with_link() {
        let ip = Ipv4Header::new(
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(5, 6, 7, 8),
            ipv4::PROTOCOL_TCP,
            7,
            64,
        );
        let eth = EthernetHeader::ipv4(MacAddr([0; 6]), MacAddr::BROADCAST);
        let frame = serialize_frame(Some(&eth), &ip, b"xy");
        assert_eq!(frame.len(), ethernet::HEADER_LEN + ipv4::HEADER_LEN + 2);

        let bare = serialize_frame(None, &ip, b"xy");
        assert_eq!(bare.len(), ipv4::HEADER_LEN + 2);
    }
}
