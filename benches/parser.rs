//! Wire codec benchmarks.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use engineio_client::parser::{decode_payload, encode_payload, Packet, PacketKind, WireData};

fn bench_encode_packet(c: &mut Criterion) {
    let packet = Packet::text(PacketKind::Message, "x".repeat(256));
    c.bench_function("encode_text_packet_256b", |b| {
        b.iter(|| black_box(&packet).encode(true).unwrap());
    });

    let packet = Packet::binary(PacketKind::Message, vec![0xAB; 256]);
    c.bench_function("encode_binary_packet_256b", |b| {
        b.iter(|| black_box(&packet).encode(true).unwrap());
    });
}

fn bench_payload_round_trip(c: &mut Criterion) {
    let packets: Vec<Packet> = (0..16)
        .map(|index| Packet::text(PacketKind::Message, format!("message number {index}")))
        .collect();

    c.bench_function("encode_payload_16_packets", |b| {
        b.iter(|| encode_payload(black_box(&packets), false).unwrap());
    });

    let encoded = encode_payload(&packets, false).unwrap();
    c.bench_function("decode_payload_16_packets", |b| {
        b.iter(|| {
            let mut count = 0usize;
            decode_payload(black_box(&encoded), |_, _, _| {
                count += 1;
                true
            });
            count
        });
    });

    let mixed: Vec<Packet> = (0..16)
        .map(|index| {
            if index % 2 == 0 {
                Packet::text(PacketKind::Message, format!("text {index}"))
            } else {
                Packet::binary(PacketKind::Message, vec![index as u8; 64])
            }
        })
        .collect();
    c.bench_function("encode_payload_16_mixed_binary", |b| {
        b.iter(|| {
            let data = encode_payload(black_box(&mixed), true).unwrap();
            matches!(data, WireData::Binary(_))
        });
    });
}

criterion_group!(benches, bench_encode_packet, bench_payload_round_trip);
criterion_main!(benches);
