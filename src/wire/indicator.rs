//! Parsed-packet view with typed layer accessors.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::wire::ethernet::{self, EthernetHeader, MacAddr, ETHERTYPE_IPV4};
use crate::wire::ipv4::{Ipv4Header, PROTOCOL_TCP, PROTOCOL_UDP};
use crate::wire::tcp::TcpHeader;
use crate::wire::udp::UdpHeader;

/// A remote endpoint address tagged with the transport that carried it.
///
/// The tunnel forges TCP on the wire but presents itself to the reliable
/// layer above as a UDP-like pipe, so inbound TCP captures are reported
/// with the [`TransportAddr::Udp`] form of the same endpoint. The
/// projection is explicit: see [`TransportAddr::as_reported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    /// An endpoint reached over (fake) TCP
    Tcp(SocketAddr),
    /// An endpoint reached over UDP
    Udp(SocketAddr),
}

impl TransportAddr {
    /// The underlying socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            TransportAddr::Tcp(addr) | TransportAddr::Udp(addr) => *addr,
        }
    }

    /// The address IP.
    pub fn ip(&self) -> IpAddr {
        self.socket_addr().ip()
    }

    /// The address port.
    pub fn port(&self) -> u16 {
        self.socket_addr().port()
    }

    /// The IPv4 form of the address, if it is IPv4.
    pub fn v4(&self) -> Option<SocketAddrV4> {
        match self.socket_addr() {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        }
    }

    /// The address as reported to callers of the tunnel.
    ///
    /// TCP endpoints are projected to UDP with the same IP and port;
    /// genuine UDP endpoints pass through unchanged.
    pub fn as_reported(&self) -> TransportAddr {
        TransportAddr::Udp(self.socket_addr())
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// The transport layer carried by a parsed packet.
#[derive(Debug, Clone)]
pub enum TransportLayer {
    /// TCP header
    Tcp(TcpHeader),
    /// UDP header
    Udp(UdpHeader),
}

impl TransportLayer {
    fn src_port(&self) -> u16 {
        match self {
            TransportLayer::Tcp(t) => t.src_port,
            TransportLayer::Udp(u) => u.src_port,
        }
    }

    fn dst_port(&self) -> u16 {
        match self {
            TransportLayer::Tcp(t) => t.dst_port,
            TransportLayer::Udp(u) => u.dst_port,
        }
    }
}

/// A parsed packet with typed accessors for each protocol layer.
///
/// Non-first fragments carry no parseable transport layer; their
/// application payload is the whole network payload.
#[derive(Debug, Clone)]
pub struct PacketIndicator {
    frame: Bytes,
    link: Option<EthernetHeader>,
    ipv4: Ipv4Header,
    net_payload_off: usize,
    net_payload_len: usize,
    transport: Option<TransportLayer>,
    app_off: usize,
}

impl PacketIndicator {
    /// Parse a captured frame starting at the Ethernet header.
    pub fn parse_frame(frame: Bytes) -> Result<Self> {
        let link = EthernetHeader::decode(&frame)?;
        if link.ethertype != ETHERTYPE_IPV4 {
            return Err(Error::UnsupportedNetworkLayer(format!(
                "ethertype 0x{:04x}",
                link.ethertype
            )));
        }
        Self::parse_at(frame, ethernet::HEADER_LEN, Some(link))
    }

    /// Parse a bare datagram starting at the IPv4 header (no link layer).
    pub fn parse_packet(data: Bytes) -> Result<Self> {
        Self::parse_at(data, 0, None)
    }

    fn parse_at(frame: Bytes, net_off: usize, link: Option<EthernetHeader>) -> Result<Self> {
        let (ipv4, hdr_len, total_len) = Ipv4Header::decode(&frame[net_off..])?;
        if frame.len() < net_off + total_len {
            return Err(Error::parse(format!(
                "datagram truncated: {} of {} bytes",
                frame.len() - net_off,
                total_len
            )));
        }
        let net_payload_off = net_off + hdr_len;
        let net_payload_len = total_len - hdr_len;

        // Only the first piece of a datagram carries the transport header
        let (transport, app_off) = if ipv4.fragment_offset == 0 {
            let payload = &frame[net_payload_off..net_payload_off + net_payload_len];
            match ipv4.protocol {
                PROTOCOL_TCP => {
                    let (tcp, off) = TcpHeader::decode(payload)?;
                    (Some(TransportLayer::Tcp(tcp)), net_payload_off + off)
                }
                PROTOCOL_UDP => {
                    let (udp, off) = UdpHeader::decode(payload)?;
                    (Some(TransportLayer::Udp(udp)), net_payload_off + off)
                }
                _ => (None, net_payload_off),
            }
        } else {
            (None, net_payload_off)
        };

        Ok(Self {
            frame,
            link,
            ipv4,
            net_payload_off,
            net_payload_len,
            transport,
            app_off,
        })
    }

    /// The raw frame bytes as captured.
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// The link layer, if the frame carried one.
    pub fn link(&self) -> Option<&EthernetHeader> {
        self.link.as_ref()
    }

    /// The IPv4 header.
    pub fn ipv4(&self) -> &Ipv4Header {
        &self.ipv4
    }

    /// The transport layer, absent on non-first fragments and unknown
    /// protocols.
    pub fn transport(&self) -> Option<&TransportLayer> {
        self.transport.as_ref()
    }

    /// The TCP header, if the packet carries one.
    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Some(TransportLayer::Tcp(t)) => Some(t),
            _ => None,
        }
    }

    /// Whether this packet is a fragment of a larger datagram.
    pub fn is_frag(&self) -> bool {
        self.ipv4.is_fragment()
    }

    /// The More Fragments flag.
    pub fn more_fragments(&self) -> bool {
        self.ipv4.more_fragments
    }

    /// The fragment offset in 8-byte units.
    pub fn frag_offset(&self) -> u16 {
        self.ipv4.fragment_offset
    }

    /// The IPv4 identification shared by all fragments of one datagram.
    pub fn network_id(&self) -> u16 {
        self.ipv4.identification
    }

    /// Source IP address.
    pub fn src_ip(&self) -> Ipv4Addr {
        self.ipv4.src
    }

    /// Destination IP address.
    pub fn dst_ip(&self) -> Ipv4Addr {
        self.ipv4.dst
    }

    /// Source hardware address, if a link layer is present.
    pub fn src_hardware_addr(&self) -> Option<MacAddr> {
        self.link.as_ref().map(|l| l.src)
    }

    /// The IPv4 payload: transport header plus application payload.
    pub fn network_payload(&self) -> &[u8] {
        &self.frame[self.net_payload_off..self.net_payload_off + self.net_payload_len]
    }

    /// The application payload behind the transport header.
    pub fn app_payload(&self) -> &[u8] {
        &self.frame[self.app_off..self.net_payload_off + self.net_payload_len]
    }

    /// Source endpoint address, when a transport layer is present.
    pub fn src(&self) -> Option<TransportAddr> {
        self.transport.as_ref().map(|t| {
            let addr = SocketAddr::V4(SocketAddrV4::new(self.ipv4.src, t.src_port()));
            match t {
                TransportLayer::Tcp(_) => TransportAddr::Tcp(addr),
                TransportLayer::Udp(_) => TransportAddr::Udp(addr),
            }
        })
    }

    /// Destination endpoint address, when a transport layer is present.
    pub fn dst(&self) -> Option<TransportAddr> {
        self.transport.as_ref().map(|t| {
            let addr = SocketAddr::V4(SocketAddrV4::new(self.ipv4.dst, t.dst_port()));
            match t {
                TransportLayer::Tcp(_) => TransportAddr::Tcp(addr),
                TransportLayer::Udp(_) => TransportAddr::Udp(addr),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{create_layers, serialize_frame, serialize_ip};
    use bytes::BytesMut;

    const SRC_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);
    const DST_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 2]);
    const SRC_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn sample_frame(payload: &[u8]) -> Bytes {
        let (tcp, ipv4, eth) =
            create_layers(40000, 50000, 7, 9, SRC_IP, DST_IP, 0x1111, 128, SRC_MAC, DST_MAC);
        let mut net_payload = BytesMut::new();
        tcp.encode(SRC_IP, DST_IP, payload, &mut net_payload);
        net_payload.extend_from_slice(payload);
        serialize_frame(Some(&eth), &ipv4, &net_payload)
    }

    #[test]
    fn test_parse_tcp_frame() {
        let ind = PacketIndicator::parse_frame(sample_frame(b"hello")).unwrap();

        assert_eq!(ind.src_ip(), SRC_IP);
        assert_eq!(ind.dst_ip(), DST_IP);
        assert_eq!(ind.network_id(), 0x1111);
        assert!(!ind.is_frag());
        assert_eq!(ind.app_payload(), b"hello");
        assert_eq!(ind.src_hardware_addr(), Some(SRC_MAC));

        let tcp = ind.tcp().expect("tcp layer");
        assert_eq!(tcp.src_port, 40000);
        assert_eq!(tcp.dst_port, 50000);
        assert_eq!(tcp.seq, 7);
        assert_eq!(tcp.ack, 9);
    }

    #[test]
    fn test_parse_without_link_layer() {
        let ipv4 = Ipv4Header::new(SRC_IP, DST_IP, PROTOCOL_UDP, 1, 64);
        let udp = UdpHeader::new(5000, 6000);
        let mut net_payload = BytesMut::new();
        udp.encode(SRC_IP, DST_IP, b"dgram", &mut net_payload);
        net_payload.extend_from_slice(b"dgram");
        let packet = serialize_ip(&ipv4, &net_payload);

        let ind = PacketIndicator::parse_packet(packet).unwrap();
        assert!(ind.link().is_none());
        assert_eq!(ind.app_payload(), b"dgram");
        assert!(matches!(ind.transport(), Some(TransportLayer::Udp(_))));
    }

    #[test]
    fn test_non_first_fragment_has_no_transport() {
        let mut ipv4 = Ipv4Header::new(SRC_IP, DST_IP, PROTOCOL_TCP, 1, 64);
        ipv4.set_flags(false, true, 3);
        let packet = serialize_ip(&ipv4, &[0xAA; 24]);

        let ind = PacketIndicator::parse_packet(packet).unwrap();
        assert!(ind.is_frag());
        assert_eq!(ind.frag_offset(), 3);
        assert!(ind.transport().is_none());
        assert_eq!(ind.app_payload().len(), 24);
        assert_eq!(ind.network_payload().len(), 24);
    }

    #[test]
    fn test_padding_stripped_by_total_length() {
        let mut padded = BytesMut::from(&sample_frame(b"x")[..]);
        padded.extend_from_slice(&[0u8; 12]); // link-layer pad
        let ind = PacketIndicator::parse_frame(padded.freeze()).unwrap();
        assert_eq!(ind.app_payload(), b"x");
    }

    #[test]
    fn test_reported_address_projection() {
        let ind = PacketIndicator::parse_frame(sample_frame(b"hi")).unwrap();
        let src = ind.src().unwrap();
        assert!(matches!(src, TransportAddr::Tcp(_)));

        let reported = src.as_reported();
        assert!(matches!(reported, TransportAddr::Udp(_)));
        assert_eq!(reported.socket_addr(), src.socket_addr());
    }

    #[test]
    fn test_non_ipv4_ethertype_rejected() {
        let eth = EthernetHeader {
            dst: DST_MAC,
            src: SRC_MAC,
            ethertype: 0x0806, // ARP
        };
        let mut buf = BytesMut::new();
        eth.encode(&mut buf);
        buf.extend_from_slice(&[0u8; 28]);
        assert!(matches!(
            PacketIndicator::parse_frame(buf.freeze()),
            Err(Error::UnsupportedNetworkLayer(_))
        ));
    }
}
