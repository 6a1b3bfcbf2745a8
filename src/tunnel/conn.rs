//! The fake-TCP connection object.
//!
//! A [`Connection`] owns a raw capture handle, a defragmenter, and a peer
//! table, and presents a packet-oriented, address-bearing, deadline-aware
//! bidirectional pipe. On the wire it speaks forged TCP: a synthesised
//! three-way handshake establishes per-peer sequence state, after which
//! payloads ride as ordinary-looking data segments. Reliability is the
//! business of whatever stacks on top.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::capture::{CaptureFilter, Device, RawConn, RawConnProvider};
use crate::crypto::Crypt;
use crate::error::{Error, Op, Result};
use crate::tunnel::fragment::{create_fragment_packets, Defragmenter, EasyDefragmenter};
use crate::tunnel::peer::PeerTable;
use crate::tunnel::{ESTABLISH_DEADLINE, KEEP_FRAGMENTS};
use crate::wire::{self, PacketIndicator, TransportAddr, TransportLayer};

struct ReadState {
    defrag: Box<dyn Defragmenter>,
}

struct TxState {
    /// IPv4 identification for the next outbound datagram
    ip_id: u16,
}

/// A packet-forging tunnel connection.
///
/// Created actively by [`Connection::dial`] or passively by
/// [`Connection::listen`] and the listener's accept path. All methods
/// take `&self`; the connection is shared behind an [`Arc`].
pub struct Connection {
    raw: Arc<dyn RawConn>,
    src_port: u16,
    dst_addr: Option<SocketAddrV4>,
    crypt: Crypt,
    mtu: usize,
    appear: std::time::Instant,
    peers: PeerTable,
    read_state: tokio::sync::Mutex<ReadState>,
    /// Serialises all outbound construction and injection, handshakes
    /// included, so sequence state never diverges from the wire
    tx: tokio::sync::Mutex<TxState>,
    read_deadline: parking_lot::Mutex<Option<Instant>>,
    write_deadline: parking_lot::Mutex<Option<Instant>>,
    is_connected: AtomicBool,
    is_reconnected: AtomicBool,
    is_closed: AtomicBool,
    shutdown: Notify,
}

impl Connection {
    fn new(
        raw: Arc<dyn RawConn>,
        src_port: u16,
        dst_addr: Option<SocketAddrV4>,
        crypt: Crypt,
        mtu: usize,
    ) -> Self {
        let mut defrag = EasyDefragmenter::new();
        defrag.set_deadline(KEEP_FRAGMENTS);
        Self {
            raw,
            src_port,
            dst_addr,
            crypt,
            mtu,
            appear: std::time::Instant::now(),
            peers: PeerTable::new(),
            read_state: tokio::sync::Mutex::new(ReadState {
                defrag: Box::new(defrag),
            }),
            tx: tokio::sync::Mutex::new(TxState { ip_id: 0 }),
            read_deadline: parking_lot::Mutex::new(None),
            write_deadline: parking_lot::Mutex::new(None),
            is_connected: AtomicBool::new(false),
            is_reconnected: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Connect to a tunnel server.
    ///
    /// Sends the initial fake SYN immediately. When `reconnect` is set, a
    /// background task re-issues a SYN every period until the connection
    /// is closed, logging when the server stops answering.
    #[allow(clippy::too_many_arguments)]
    pub async fn dial(
        provider: &dyn RawConnProvider,
        src_dev: &Device,
        dst_dev: &Device,
        src_port: u16,
        dst_addr: SocketAddrV4,
        crypt: Crypt,
        mtu: usize,
        reconnect: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let local = SocketAddrV4::new(src_dev.ip_addr(), src_port);
        let conn = Self::dial_passive(provider, src_dev, dst_dev, src_port, dst_addr, crypt, mtu)
            .map_err(|e| e.with_op(Op::Dial, local, dst_addr))?;

        tracing::info!("connect to server {}", dst_addr);

        conn.handshake_syn(dst_addr)
            .await
            .map_err(|e| e.with_op(Op::Handshake, local, dst_addr).with_op(Op::Dial, local, dst_addr))?;

        // One-shot check that the SYN was answered
        {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                tokio::select! {
                    _ = conn.shutdown.notified() => {}
                    _ = time::sleep(ESTABLISH_DEADLINE) => {
                        if !conn.is_connected() && !conn.is_closed() {
                            tracing::error!("no response from server {}, is it down?", dst_addr);
                        }
                    }
                }
            });
        }

        if let Some(period) = reconnect {
            conn.spawn_reconnect(period, dst_addr);
        }

        Ok(conn)
    }

    /// Open a passive connection to one remote endpoint: the capture and
    /// peer machinery of [`Connection::dial`] without the initial SYN.
    pub(crate) fn dial_passive(
        provider: &dyn RawConnProvider,
        src_dev: &Device,
        dst_dev: &Device,
        src_port: u16,
        dst_addr: SocketAddrV4,
        crypt: Crypt,
        mtu: usize,
    ) -> Result<Arc<Self>> {
        let filter = CaptureFilter::Client { src_port, dst: dst_addr };
        let raw = provider.open(src_dev, dst_dev, &filter)?;
        Ok(Arc::new(Self::new(raw, src_port, Some(dst_addr), crypt, mtu)))
    }

    /// Open the shared server data plane: a passive connection capturing
    /// all tunnel traffic to `src_port`, with peers admitted by the
    /// listener's handshake path.
    pub fn listen(
        provider: &dyn RawConnProvider,
        src_dev: &Device,
        dst_dev: &Device,
        src_port: u16,
        crypt: Crypt,
        mtu: usize,
    ) -> Result<Arc<Self>> {
        let local = SocketAddrV4::new(src_dev.ip_addr(), src_port);
        let raw = provider
            .open(src_dev, dst_dev, &CaptureFilter::Multicast { src_port })
            .map_err(|e| e.with_op(Op::Listen, local, "*"))?;
        Ok(Arc::new(Self::new(raw, src_port, None, crypt, mtu)))
    }

    fn spawn_reconnect(self: &Arc<Self>, period: Duration, dst: SocketAddrV4) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conn.shutdown.notified() => return,
                    _ = time::sleep(period) => {}
                }
                if conn.is_closed() {
                    return;
                }

                conn.is_reconnected.store(false, Ordering::SeqCst);
                if let Err(err) = conn.handshake_syn(dst).await {
                    tracing::error!(
                        "{}",
                        err.with_op(Op::Handshake, conn.local_addr_v4(), dst)
                    );
                }

                let checker = Arc::clone(&conn);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = checker.shutdown.notified() => {}
                        _ = time::sleep(ESTABLISH_DEADLINE) => {
                            if !checker.is_reconnected.load(Ordering::SeqCst) && !checker.is_closed() {
                                tracing::error!("no response from server {}, is it down?", dst);
                            }
                        }
                    }
                });
            }
        });
    }

    /// Send the client half of the fake handshake.
    async fn handshake_syn(&self, dst: SocketAddrV4) -> Result<()> {
        let mut tx = self.tx.lock().await;

        let peer = self.peers.get_or_insert(dst, &self.crypt);
        let (seq, ack) = {
            let state = peer.state();
            (state.tx_seq, state.rx_ack)
        };

        let (mut tcp, ipv4, eth) = wire::create_layers(
            self.src_port,
            dst.port(),
            seq,
            ack,
            self.raw.local_dev().ip_addr(),
            *dst.ip(),
            tx.ip_id,
            128,
            self.raw.local_dev().hardware_addr(),
            self.raw.remote_dev().hardware_addr(),
        );
        tcp.set_flags(true, false, false);

        self.write_segment(&eth, &ipv4, &tcp).await?;

        peer.state().tx_seq = seq.wrapping_add(1);
        tx.ip_id = tx.ip_id.wrapping_add(1);

        tracing::debug!("send TCP SYN: {} -> {}", self.local_addr_v4(), dst);
        Ok(())
    }

    /// Answer a captured SYN with SYN+ACK (server half of the handshake).
    pub(crate) async fn handshake_synack(&self, ind: &PacketIndicator) -> Result<()> {
        let tcp_in = ind
            .tcp()
            .ok_or_else(|| Error::parse("handshake packet without TCP layer"))?
            .clone();
        let src = SocketAddrV4::new(ind.src_ip(), tcp_in.src_port);

        let mut tx = self.tx.lock().await;

        let peer = self.peers.get_or_insert(src, &self.crypt);
        peer.state().rx_ack = tcp_in.seq.wrapping_add(1);
        let (seq, ack) = {
            let state = peer.state();
            (state.tx_seq, state.rx_ack)
        };

        let dst_mac = ind
            .src_hardware_addr()
            .unwrap_or_else(|| self.raw.remote_dev().hardware_addr());
        let (mut tcp, ipv4, eth) = wire::create_layers(
            tcp_in.dst_port,
            tcp_in.src_port,
            seq,
            ack,
            self.raw.local_dev().ip_addr(),
            ind.src_ip(),
            tx.ip_id,
            64,
            self.raw.local_dev().hardware_addr(),
            dst_mac,
        );
        tcp.set_flags(true, false, true);

        self.write_segment(&eth, &ipv4, &tcp).await?;

        peer.state().tx_seq = seq.wrapping_add(1);
        tx.ip_id = tx.ip_id.wrapping_add(1);

        tracing::debug!(
            "send TCP SYN+ACK: {} <- {}",
            src,
            SocketAddrV4::new(self.raw.local_dev().ip_addr(), tcp_in.dst_port)
        );
        Ok(())
    }

    /// Complete the client half of the handshake after a SYN+ACK.
    async fn handshake_ack(&self, ind: &PacketIndicator) -> Result<()> {
        let tcp_in = ind
            .tcp()
            .ok_or_else(|| Error::parse("handshake packet without TCP layer"))?
            .clone();
        let src = SocketAddrV4::new(ind.src_ip(), tcp_in.src_port);

        let mut tx = self.tx.lock().await;

        let peer = self
            .peers
            .get(&src)
            .ok_or(Error::Unauthorized(SocketAddr::V4(src)))?;
        peer.state().rx_ack = tcp_in.seq.wrapping_add(1);
        let (seq, ack) = {
            let state = peer.state();
            (state.tx_seq, state.rx_ack)
        };

        let dst_mac = ind
            .src_hardware_addr()
            .unwrap_or_else(|| self.raw.remote_dev().hardware_addr());
        let (mut tcp, ipv4, eth) = wire::create_layers(
            tcp_in.dst_port,
            tcp_in.src_port,
            seq,
            ack,
            self.raw.local_dev().ip_addr(),
            ind.src_ip(),
            tx.ip_id,
            128,
            self.raw.local_dev().hardware_addr(),
            dst_mac,
        );
        tcp.set_flags(false, false, true);

        self.write_segment(&eth, &ipv4, &tcp).await?;

        tx.ip_id = tx.ip_id.wrapping_add(1);

        tracing::debug!("send TCP ACK: {} -> {}", self.local_addr_v4(), src);
        Ok(())
    }

    /// Serialise and inject one payload-less segment.
    async fn write_segment(
        &self,
        eth: &wire::EthernetHeader,
        ipv4: &wire::Ipv4Header,
        tcp: &wire::TcpHeader,
    ) -> Result<()> {
        let mut segment = BytesMut::new();
        tcp.encode(ipv4.src, ipv4.dst, &[], &mut segment);
        let frame = wire::serialize_frame(Some(eth), ipv4, &segment);
        self.raw.write(&frame).await?;
        Ok(())
    }

    /// Receive the next payload. See [`Connection::recv_from`].
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    /// Receive the next payload and the address it came from.
    ///
    /// Handshake segments are answered internally and reported as
    /// zero-length reads; callers loop. The returned address is always
    /// the UDP projection of the sender, which is how the tunnel presents
    /// itself to the datagram-oriented layer above.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, TransportAddr)> {
        let local = self.local_addr_v4();
        let (ind, addr) = self
            .read_packet_from()
            .await
            .map_err(|e| e.with_op(Op::Read, local, self.remote_label()))?;

        if let Some(TransportLayer::Tcp(tcp)) = ind.transport() {
            if tcp.syn {
                if tcp.ack_flag {
                    tracing::debug!("receive TCP SYN+ACK: {} <- {}", local, addr);
                    if !self.is_connected.swap(true, Ordering::SeqCst) {
                        let rtt = self.appear.elapsed();
                        tracing::info!(
                            "connected to server {} in {:.3} ms (RTT)",
                            addr,
                            rtt.as_secs_f64() * 1000.0
                        );
                    }
                    self.is_reconnected.store(true, Ordering::SeqCst);
                    self.handshake_ack(&ind)
                        .await
                        .map_err(|e| e.with_op(Op::Handshake, local, addr))?;
                } else {
                    tracing::debug!("receive TCP SYN: {} -> {}", addr, local);
                    self.handshake_synack(&ind)
                        .await
                        .map_err(|e| e.with_op(Op::Handshake, local, addr))?;
                }
                return Ok((0, addr));
            }
        }

        let payload = ind.app_payload();
        if payload.is_empty() {
            return Ok((0, addr));
        }

        let peer_addr = addr
            .v4()
            .ok_or(Error::UnsupportedAddressType(addr.socket_addr()))?;
        let peer = self
            .peers
            .get(&peer_addr)
            .ok_or(Error::Unauthorized(addr.socket_addr()))
            .map_err(|e| e.with_op(Op::Read, local, addr))?;

        if let Some(TransportLayer::Tcp(tcp)) = ind.transport() {
            peer.state().advance_rx_ack(tcp.seq, payload.len() as u32);
        }

        let contents = peer
            .crypt()
            .decrypt(payload)
            .map_err(|e| e.with_op(Op::Read, local, addr))?;

        let n = contents.len().min(buf.len());
        buf[..n].copy_from_slice(&contents[..n]);
        Ok((n, addr))
    }

    /// Drain the capture until a complete datagram is available, racing
    /// the read deadline when one is set.
    async fn read_packet_from(&self) -> Result<(PacketIndicator, TransportAddr)> {
        let deadline = *self.read_deadline.lock();
        let mut read_state = self.read_state.lock().await;
        let state = &mut *read_state;

        let read_loop = async {
            loop {
                let frame = self.raw.read_packet().await?;
                let ind = match PacketIndicator::parse_frame(frame) {
                    Ok(ind) => ind,
                    Err(err) => {
                        tracing::debug!("drop unparsable frame: {}", err);
                        continue;
                    }
                };
                match state.defrag.append(ind) {
                    Ok(Some(whole)) => break Ok::<_, Error>(whole),
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::debug!("drop fragment flow: {}", err);
                        continue;
                    }
                }
            }
        };

        let ind = match deadline {
            Some(at) => tokio::select! {
                packet = read_loop => packet?,
                _ = time::sleep_until(at) => return Err(Error::Timeout),
            },
            None => read_loop.await?,
        };

        match ind.src() {
            Some(addr) => {
                let addr = addr.as_reported();
                Ok((ind, addr))
            }
            None => Err(Error::UnsupportedTransportLayer(format!(
                "protocol {}",
                ind.ipv4().protocol
            ))),
        }
    }

    /// Send a payload to the dialed remote endpoint.
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        let dst = match self.dst_addr {
            Some(dst) => dst,
            None => {
                let unknown = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
                return Err(Error::Unrecognized(SocketAddr::V4(unknown)).with_op(
                    Op::Write,
                    self.local_addr_v4(),
                    "*",
                ));
            }
        };
        self.send_to(buf, TransportAddr::Tcp(SocketAddr::V4(dst))).await
    }

    /// Send a payload to `addr`, which may carry either the TCP or the
    /// UDP form of the endpoint.
    ///
    /// On success the whole payload was handed to the device, in fragment
    /// order, and the peer's sequence advanced by the ciphertext length.
    pub async fn send_to(&self, buf: &[u8], addr: TransportAddr) -> Result<usize> {
        let local = self.local_addr_v4();
        let dst = addr
            .v4()
            .ok_or(Error::UnsupportedAddressType(addr.socket_addr()))
            .map_err(|e| e.with_op(Op::Write, local, addr))?;

        let deadline = *self.write_deadline.lock();
        let write = self.write_packet(dst, buf);

        let result = match deadline {
            Some(at) => tokio::select! {
                result = write => result,
                _ = time::sleep_until(at) => Err(Error::Timeout),
            },
            None => write.await,
        };
        result.map_err(|e| e.with_op(Op::Write, local, dst))?;

        Ok(buf.len())
    }

    /// Build, fragment, and inject one data packet under the write gate.
    async fn write_packet(&self, dst: SocketAddrV4, buf: &[u8]) -> Result<()> {
        let mut tx = self.tx.lock().await;

        let peer = self
            .peers
            .get(&dst)
            .ok_or(Error::Unrecognized(SocketAddr::V4(dst)))?;
        let (seq, ack) = {
            let state = peer.state();
            (state.tx_seq, state.rx_ack)
        };

        let (tcp, ipv4, eth) = wire::create_layers(
            self.src_port,
            dst.port(),
            seq,
            ack,
            self.raw.local_dev().ip_addr(),
            *dst.ip(),
            tx.ip_id,
            128,
            self.raw.local_dev().hardware_addr(),
            self.raw.remote_dev().hardware_addr(),
        );

        let contents = peer.crypt().encrypt(buf)?;

        let fragments = create_fragment_packets(Some(&eth), &ipv4, Some(&tcp), &contents, self.mtu)?;
        for fragment in &fragments {
            self.raw.write(fragment).await?;
        }

        peer.state().tx_seq = seq.wrapping_add(contents.len() as u32);
        tx.ip_id = tx.ip_id.wrapping_add(1);
        Ok(())
    }

    /// Set the read deadline. `None` disables it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        *self.read_deadline.lock() = deadline;
        Ok(())
    }

    /// Set the write deadline. `None` disables it.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        *self.write_deadline.lock() = deadline;
        Ok(())
    }

    /// Set both deadlines atomically: if the write side cannot be set,
    /// the read side is rolled back.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let previous = *self.read_deadline.lock();
        self.set_read_deadline(deadline)?;
        if let Err(err) = self.set_write_deadline(deadline) {
            let _ = self.set_read_deadline(previous);
            return Err(err);
        }
        Ok(())
    }

    /// Tear the connection down.
    ///
    /// Sticky and idempotent: the first call closes the capture and ends
    /// the background handshake tasks; later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.is_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.notify_waiters();
        self.raw
            .close()
            .map_err(|e| e.with_op(Op::Close, self.local_addr_v4(), self.remote_label()))
    }

    /// The local device.
    pub fn local_dev(&self) -> &Device {
        self.raw.local_dev()
    }

    /// The remote (gateway) device.
    pub fn remote_dev(&self) -> &Device {
        self.raw.remote_dev()
    }

    fn local_addr_v4(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.raw.local_dev().ip_addr(), self.src_port)
    }

    /// The local address, in the UDP form the tunnel reports upward.
    pub fn local_addr(&self) -> TransportAddr {
        TransportAddr::Udp(SocketAddr::V4(self.local_addr_v4()))
    }

    /// The dialed remote endpoint, absent on the shared server data plane.
    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.dst_addr
    }

    fn remote_label(&self) -> String {
        match self.dst_addr {
            Some(addr) => addr.to_string(),
            None => "*".to_string(),
        }
    }

    /// Whether the first SYN+ACK has been received.
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub(crate) fn crypt(&self) -> &Crypt {
        &self.crypt
    }
}
