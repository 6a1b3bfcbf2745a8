//! Passive endpoint: accepts fake handshakes and spawns per-client
//! connections.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::capture::{CaptureFilter, Device, RawConn, RawConnProvider};
use crate::crypto::Crypt;
use crate::error::{Error, Op, Result};
use crate::tunnel::conn::Connection;
use crate::tunnel::peer::Peer;
use crate::wire::PacketIndicator;

/// One turn of the listener's accept loop.
#[derive(Clone)]
pub enum AcceptOutcome {
    /// A new client completed the server half of the handshake
    Accepted(Arc<Connection>),
    /// A SYN arrived from a source that already has a connection;
    /// benign, callers loop and accept again
    Duplicate(SocketAddrV4),
}

/// Waits for inbound SYNs on a filtered capture and drives the server
/// half of the fake handshake.
pub struct Listener {
    raw: Arc<dyn RawConn>,
    provider: Arc<dyn RawConnProvider>,
    src_dev: Device,
    dst_dev: Device,
    src_port: u16,
    crypt: Crypt,
    mtu: usize,
    clients: Mutex<HashMap<SocketAddrV4, Arc<Connection>>>,
}

impl Listener {
    /// Open a listener on `src_port`.
    pub fn bind(
        provider: Arc<dyn RawConnProvider>,
        src_dev: &Device,
        dst_dev: &Device,
        src_port: u16,
        crypt: Crypt,
        mtu: usize,
    ) -> Result<Self> {
        let local = SocketAddrV4::new(src_dev.ip_addr(), src_port);
        let raw = provider
            .open(src_dev, dst_dev, &CaptureFilter::Listener { src_port })
            .map_err(|e| e.with_op(Op::Listen, local, "*"))?;

        tracing::info!("listen on {}", local);

        Ok(Self {
            raw,
            provider,
            src_dev: src_dev.clone(),
            dst_dev: dst_dev.clone(),
            src_port,
            crypt,
            mtu,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Wait for one SYN and handle it.
    ///
    /// A SYN from a known source yields [`AcceptOutcome::Duplicate`]
    /// without opening anything; otherwise a per-client [`Connection`] is
    /// opened, the source installed in its peer table, and the SYN+ACK
    /// sent.
    pub async fn accept(&self) -> Result<AcceptOutcome> {
        let local = self.local_addr();

        let frame = self
            .raw
            .read_packet()
            .await
            .map_err(|e| e.with_op(Op::Accept, local, "*"))?;
        let ind = PacketIndicator::parse_frame(frame)
            .map_err(|e| e.with_op(Op::Accept, local, "*"))?;

        let tcp = ind
            .tcp()
            .ok_or_else(|| Error::parse("handshake packet without TCP layer"))
            .map_err(|e| e.with_op(Op::Accept, local, "*"))?;
        let src = SocketAddrV4::new(ind.src_ip(), tcp.src_port);

        if self.clients.lock().contains_key(&src) {
            return Ok(AcceptOutcome::Duplicate(src));
        }

        let conn = Connection::dial_passive(
            self.provider.as_ref(),
            &self.src_dev,
            &self.dst_dev,
            self.src_port,
            src,
            self.crypt.clone(),
            self.mtu,
        )
        .map_err(|e| e.with_op(Op::Dial, local, src))?;

        conn.peers().insert(src, Arc::new(Peer::new(conn.crypt().clone())));

        conn.handshake_synack(&ind)
            .await
            .map_err(|e| e.with_op(Op::Handshake, local, src))?;

        self.clients.lock().insert(src, Arc::clone(&conn));
        tracing::debug!("accept client {}", src);

        Ok(AcceptOutcome::Accepted(conn))
    }

    /// Close the handshake capture. Per-client connections stay open.
    pub fn close(&self) -> Result<()> {
        self.raw
            .close()
            .map_err(|e| e.with_op(Op::Close, self.local_addr(), "*"))
    }

    /// The device the listener captures on.
    pub fn dev(&self) -> &Device {
        self.raw.local_dev()
    }

    /// The listening address.
    pub fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_dev.ip_addr(), self.src_port)
    }

    /// Number of accepted clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}
