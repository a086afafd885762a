use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dnsconduit::dns::DnsMessage;
use dnsconduit::{Flags, Segment, SegmentCodec};

/// Segment to DNS name and back, at full payload for each suffix
fn bench_segment_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_codec");

    for suffix in ["example.com", "tunnel.some-longer-domain.example.org"] {
        let codec = SegmentCodec::new('t', suffix).unwrap();
        let payload = Bytes::from(vec![0xa5u8; codec.payload_capacity()]);
        let segment = Segment::new(0x1234, Flags::ACK, 1000, 2000, payload);
        let name = codec.encode(&segment).unwrap();

        group.throughput(Throughput::Bytes(codec.payload_capacity() as u64));
        group.bench_with_input(BenchmarkId::new("encode", suffix), &segment, |b, segment| {
            b.iter(|| codec.encode(black_box(segment)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decode", suffix), &name, |b, name| {
            b.iter(|| codec.decode(black_box(name)));
        });
    }

    group.finish();
}

/// CNAME answer construction and parsing
fn bench_dns_messages(c: &mut Criterion) {
    let codec = SegmentCodec::new('t', "example.com").unwrap();
    let segment = Segment::new(7, Flags::ACK, 1, 1, Bytes::from(vec![1u8; 64]));
    let name = codec.encode(&segment).unwrap();
    let query = DnsMessage::new_query(&name, 42);
    let reply = DnsMessage::cname_response(&query, &name, 0).to_bytes().unwrap();

    c.bench_function("dns_cname_response_build", |b| {
        b.iter(|| {
            DnsMessage::cname_response(black_box(&query), &name, 0)
                .to_bytes()
                .unwrap()
        });
    });

    c.bench_function("dns_cname_response_parse", |b| {
        b.iter(|| DnsMessage::parse(black_box(&reply)).unwrap());
    });
}

criterion_group!(benches, bench_segment_codec, bench_dns_messages);
criterion_main!(benches);
