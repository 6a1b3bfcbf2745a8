//! Tunnel hot-path benchmarks.
//!
//! Measures the per-packet costs: fragmenting outbound datagrams,
//! reassembling captured fragments, and sealing payloads.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use std::net::Ipv4Addr;

use camoflow::crypto::{Crypt, Key};
use camoflow::tunnel::{create_fragment_packets, Defragmenter, EasyDefragmenter};
use camoflow::wire::{create_layers, MacAddr, PacketIndicator};

const SRC_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const DST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const SRC_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);
const DST_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 2]);

fn bench_fragment(c: &mut Criterion) {
    let payload = vec![0u8; 8192];
    let (tcp, ipv4, eth) =
        create_layers(19999, 20000, 1, 1, SRC_IP, DST_IP, 1, 128, SRC_MAC, DST_MAC);

    let mut group = c.benchmark_group("fragment");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("8192_bytes_mtu_1500", |b| {
        b.iter(|| {
            black_box(
                create_fragment_packets(Some(&eth), &ipv4, Some(&tcp), &payload, 1500).unwrap(),
            )
        })
    });

    group.finish();
}

fn bench_defragment(c: &mut Criterion) {
    let payload = vec![0u8; 8192];
    let (tcp, ipv4, eth) =
        create_layers(19999, 20000, 1, 1, SRC_IP, DST_IP, 1, 128, SRC_MAC, DST_MAC);
    let frames = create_fragment_packets(Some(&eth), &ipv4, Some(&tcp), &payload, 1500).unwrap();
    let indicators: Vec<PacketIndicator> = frames
        .iter()
        .map(|f| PacketIndicator::parse_frame(f.clone()).unwrap())
        .collect();

    let mut group = c.benchmark_group("defragment");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("8192_bytes_mtu_1500", |b| {
        b.iter(|| {
            let mut defrag = EasyDefragmenter::new();
            let mut whole = None;
            for ind in &indicators {
                if let Some(packet) = defrag.append(ind.clone()).unwrap() {
                    whole = Some(packet);
                }
            }
            black_box(whole.unwrap())
        })
    });

    group.finish();
}

fn bench_seal(c: &mut Criterion) {
    let crypt = Crypt::chacha20_poly1305(&Key::from_passphrase("bench"));
    let payload = vec![0u8; 1400];

    let mut group = c.benchmark_group("seal");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("encrypt_1400_bytes", |b| {
        b.iter(|| black_box(crypt.encrypt(&payload).unwrap()))
    });

    let sealed = crypt.encrypt(&payload).unwrap();
    group.bench_function("decrypt_1400_bytes", |b| {
        b.iter(|| black_box(crypt.decrypt(&sealed).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_fragment, bench_defragment, bench_seal);
criterion_main!(benches);
