//! Criterion benchmarks for the netwatch hot path:
//! - `protocol::decode` (layered header walk + record construction)
//! - `StatsEngine::update` (aggregate fold under the stats mutex)

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netwatch::protocol;
use netwatch::stats::StatsEngine;

/// Ethernet + IPv4 + TCP frame with `payload_len` bytes of payload.
fn make_tcp_packet(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    payload_len: usize,
) -> Vec<u8> {
    let mut pkt = vec![0u8; 14 + 20 + 20 + payload_len];

    pkt[0..6].copy_from_slice(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    pkt[6..12].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    pkt[12] = 0x08;
    pkt[13] = 0x00;

    let ip = &mut pkt[14..34];
    ip[0] = 0x45;
    let total: u16 = (20 + 20 + payload_len) as u16;
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    ip[8] = 64;
    ip[9] = 6;
    ip[12..16].copy_from_slice(&src_ip);
    ip[16..20].copy_from_slice(&dst_ip);

    let tcp = &mut pkt[34..54];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[12] = 0x50;
    tcp[13] = 0x10; // ACK
    tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());

    for (i, byte) in pkt[54..].iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }
    pkt
}

fn bench_decode(c: &mut Criterion) {
    let syn = make_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 12345, 80, 1000, 0);
    let data = make_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 12345, 80, 1000, 1400);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("tcp_syn_54B", |b| {
        let ts = Utc::now();
        b.iter(|| protocol::decode(black_box(&syn), syn.len(), ts))
    });

    group.bench_function("tcp_data_1454B", |b| {
        let ts = Utc::now();
        b.iter(|| protocol::decode(black_box(&data), data.len(), ts))
    });

    group.finish();
}

fn bench_stats_update(c: &mut Criterion) {
    let pkt = make_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 12345, 80, 1000, 100);
    let record = protocol::decode(&pkt, pkt.len(), Utc::now());

    let mut group = c.benchmark_group("stats_update");
    group.throughput(Throughput::Elements(1));

    group.bench_function("existing_flow", |b| {
        let engine = StatsEngine::new();
        engine.update(&record);
        b.iter(|| engine.update(black_box(&record)))
    });

    group.finish();
}

criterion_group!(benches, bench_decode, bench_stats_update);
criterion_main!(benches);
