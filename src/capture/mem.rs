//! In-memory capture backend.
//!
//! A [`MemSegment`] behaves like a tiny shared Ethernet segment: every
//! frame written by one attached tap is delivered to every other tap
//! whose filter admits it. Filters evaluate the same predicates the
//! tunnel's BPF expressions select on real devices. Used by the loopback
//! demo and the test suite; production captures go through a real pcap
//! backend behind the same traits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::capture::{CaptureFilter, Device, RawConn, RawConnProvider};
use crate::error::{Error, Result};
use crate::wire::PacketIndicator;

/// A frame-admission predicate standing in for a compiled BPF program.
pub type FramePredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Evaluate a [`CaptureFilter`] the way the kernel would evaluate its BPF
/// expression.
///
/// Port comparisons only apply to packets whose transport header is
/// readable (fragment offset zero), matching BPF's behaviour on
/// fragmented traffic.
pub fn compile_filter(filter: &CaptureFilter) -> FramePredicate {
    let filter = filter.clone();
    Arc::new(move |frame| {
        let ind = match PacketIndicator::parse_frame(Bytes::copy_from_slice(frame)) {
            Ok(ind) => ind,
            Err(_) => return false,
        };
        match &filter {
            CaptureFilter::Client { src_port, dst } => {
                if ind.frag_offset() != 0 {
                    return ind.src_ip() == *dst.ip();
                }
                match ind.tcp() {
                    Some(tcp) => {
                        tcp.dst_port == *src_port
                            && ind.src_ip() == *dst.ip()
                            && tcp.src_port == dst.port()
                    }
                    None => false,
                }
            }
            CaptureFilter::Listener { src_port } => match ind.tcp() {
                Some(tcp) => tcp.syn && tcp.dst_port == *src_port,
                None => false,
            },
            CaptureFilter::Multicast { src_port } => match ind.tcp() {
                Some(tcp) => tcp.dst_port == *src_port,
                None => false,
            },
        }
    })
}

struct Tap {
    id: u64,
    sender: mpsc::UnboundedSender<Bytes>,
    filter: Option<FramePredicate>,
}

/// A shared in-memory link segment.
pub struct MemSegment {
    taps: Mutex<Vec<Tap>>,
    next_id: AtomicU64,
}

impl MemSegment {
    /// Create an empty segment.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            taps: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Attach an unfiltered tap (sees every frame from other taps).
    pub fn attach(self: &Arc<Self>, local: Device, remote: Device) -> Arc<MemConn> {
        self.attach_with(local, remote, None)
    }

    /// Attach a tap whose inbound frames pass through `filter`.
    pub fn attach_filtered(
        self: &Arc<Self>,
        local: Device,
        remote: Device,
        filter: FramePredicate,
    ) -> Arc<MemConn> {
        self.attach_with(local, remote, Some(filter))
    }

    fn attach_with(
        self: &Arc<Self>,
        local: Device,
        remote: Device,
        filter: Option<FramePredicate>,
    ) -> Arc<MemConn> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, rx) = mpsc::unbounded_channel();
        self.taps.lock().push(Tap { id, sender, filter });
        Arc::new(MemConn {
            id,
            segment: Arc::clone(self),
            local,
            remote,
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    fn broadcast(&self, from: u64, frame: &[u8]) {
        let taps = self.taps.lock();
        for tap in taps.iter() {
            if tap.id == from {
                continue;
            }
            if let Some(filter) = &tap.filter {
                if !filter(frame) {
                    continue;
                }
            }
            let _ = tap.sender.send(Bytes::copy_from_slice(frame));
        }
    }

    fn detach(&self, id: u64) {
        self.taps.lock().retain(|tap| tap.id != id);
    }
}

/// One tap on a [`MemSegment`], usable wherever a raw capture is.
pub struct MemConn {
    id: u64,
    segment: Arc<MemSegment>,
    local: Device,
    remote: Device,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

#[async_trait]
impl RawConn for MemConn {
    async fn read_packet(&self) -> Result<Bytes> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::raw_io("capture closed"));
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or_else(|| Error::raw_io("capture closed"))
    }

    async fn write(&self, frame: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::raw_io("capture closed"));
        }
        self.segment.broadcast(self.id, frame);
        Ok(frame.len())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping our sender wakes a pending read with "capture closed"
        self.segment.detach(self.id);
        Ok(())
    }

    fn local_dev(&self) -> &Device {
        &self.local
    }

    fn remote_dev(&self) -> &Device {
        &self.remote
    }
}

impl Drop for MemConn {
    fn drop(&mut self) {
        self.segment.detach(self.id);
    }
}

/// Opens filtered taps on a shared segment.
pub struct MemProvider {
    segment: Arc<MemSegment>,
}

impl MemProvider {
    /// Create a provider over `segment`.
    pub fn new(segment: Arc<MemSegment>) -> Self {
        Self { segment }
    }

    /// The underlying segment.
    pub fn segment(&self) -> &Arc<MemSegment> {
        &self.segment
    }
}

impl RawConnProvider for MemProvider {
    fn open(&self, src: &Device, dst: &Device, filter: &CaptureFilter) -> Result<Arc<dyn RawConn>> {
        Ok(self
            .segment
            .attach_filtered(src.clone(), dst.clone(), compile_filter(filter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{create_layers, serialize_frame, MacAddr};
    use bytes::BytesMut;
    use std::net::Ipv4Addr;

    fn dev(name: &str, last: u8) -> Device {
        Device::new(name, MacAddr([2, 0, 0, 0, 0, last]), Ipv4Addr::new(10, 0, 0, last))
    }

    fn tcp_frame(src_port: u16, dst_port: u16, syn: bool) -> Bytes {
        let (mut tcp, ipv4, eth) = create_layers(
            src_port,
            dst_port,
            0,
            0,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            128,
            MacAddr([2, 0, 0, 0, 0, 1]),
            MacAddr([2, 0, 0, 0, 0, 2]),
        );
        if syn {
            tcp.set_flags(true, false, false);
        }
        let mut payload = BytesMut::new();
        tcp.encode(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), &[], &mut payload);
        serialize_frame(Some(&eth), &ipv4, &payload)
    }

    #[tokio::test]
    async fn test_broadcast_between_taps() {
        let segment = MemSegment::new();
        let a = segment.attach(dev("a", 1), dev("b", 2));
        let b = segment.attach(dev("b", 2), dev("a", 1));

        a.write(b"frame").await.unwrap();
        assert_eq!(b.read_packet().await.unwrap(), Bytes::from_static(b"frame"));
    }

    #[tokio::test]
    async fn test_writer_does_not_hear_itself() {
        let segment = MemSegment::new();
        let a = segment.attach(dev("a", 1), dev("b", 2));
        let b = segment.attach(dev("b", 2), dev("a", 1));

        a.write(b"one").await.unwrap();
        b.write(b"two").await.unwrap();
        assert_eq!(a.read_packet().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_listener_filter_admits_only_syn() {
        let segment = MemSegment::new();
        let sender = segment.attach(dev("a", 1), dev("b", 2));
        let listener = segment.attach_filtered(
            dev("b", 2),
            dev("a", 1),
            compile_filter(&CaptureFilter::Listener { src_port: 20000 }),
        );

        sender.write(&tcp_frame(40000, 20000, false)).await.unwrap();
        sender.write(&tcp_frame(40000, 30000, true)).await.unwrap();
        sender.write(&tcp_frame(40000, 20000, true)).await.unwrap();

        // Only the SYN to port 20000 arrives
        let frame = listener.read_packet().await.unwrap();
        let ind = PacketIndicator::parse_frame(frame).unwrap();
        assert!(ind.tcp().unwrap().syn);
        assert_eq!(ind.tcp().unwrap().dst_port, 20000);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let segment = MemSegment::new();
        let a = segment.attach(dev("a", 1), dev("b", 2));

        let reader = Arc::clone(&a);
        let task = tokio::spawn(async move { reader.read_packet().await });
        tokio::task::yield_now().await;

        a.close().unwrap();
        let result = task.await.unwrap();
        assert!(result.unwrap_err().is_raw_io());
    }
}
