use criterion::{black_box, criterion_group, criterion_main, Criterion};
use proxy_wire::{split_tlvs, ProxyHeader, Tlv, TlvKind, Transport};

const V1_TCP4: &[u8] = b"PROXY TCP4 127.0.0.1 192.168.0.1 12345 443\r\n";

const V2_TCP4_TLV: &[u8] = &[
    13, 10, 13, 10, 0, 13, 10, 81, 85, 73, 84, 10, 33, 17, 0, 104, 127, 0, 0, 1, 192, 168, 0, 1,
    48, 57, 1, 187, 3, 0, 4, 211, 153, 216, 216, 5, 0, 4, 49, 50, 51, 52, 32, 0, 75, 7, 0, 0, 0, 0,
    33, 0, 7, 84, 76, 83, 118, 49, 46, 51, 34, 0, 9, 108, 111, 99, 97, 108, 104, 111, 115, 116, 37,
    0, 7, 82, 83, 65, 52, 48, 57, 54, 36, 0, 10, 82, 83, 65, 45, 83, 72, 65, 50, 53, 54, 35, 0, 22,
    84, 76, 83, 95, 65, 69, 83, 95, 50, 53, 54, 95, 71, 67, 77, 95, 83, 72, 65, 51, 56, 52,
];

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("parse_v1_tcp4", |b| {
        b.iter(|| ProxyHeader::parse(black_box(V1_TCP4)).unwrap())
    });

    c.bench_function("parse_v2_tcp4_tlv", |b| {
        b.iter(|| ProxyHeader::parse(black_box(V2_TCP4_TLV)).unwrap())
    });

    c.bench_function("split_tlvs", |b| {
        let (header, _) = ProxyHeader::parse(V2_TCP4_TLV).unwrap();
        b.iter(|| split_tlvs(black_box(header.raw_tlvs())).unwrap())
    });

    c.bench_function("format_v1_tcp4", |b| {
        let (header, _) = ProxyHeader::parse(V1_TCP4).unwrap();
        b.iter(|| header.format().unwrap())
    });

    c.bench_function("format_v2_tcp4_tlv", |b| {
        let mut header = ProxyHeader::proxy(
            Transport::Tcp4,
            "127.0.0.1:12345".parse::<std::net::SocketAddr>().unwrap().into(),
            "192.168.0.1:443".parse::<std::net::SocketAddr>().unwrap().into(),
        );
        header
            .set_tlvs(&[
                Tlv::new(TlvKind::UNIQUE_ID, &b"1234"[..]),
                Tlv::new(TlvKind::AUTHORITY, &b"localhost"[..]),
            ])
            .unwrap();
        b.iter(|| header.format().unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
