// Storage receipt benchmarks.
//
// Covers receipt signing and opening, full verification against a block
// header, and header signature-set verification at various committee sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shardstore_protocol::common::Namespace;
use shardstore_protocol::crypto::{Hash, Keypair};
use shardstore_protocol::roothash::{verify_receipt, verify_receipt_signatures, Header, HeaderType};
use shardstore_protocol::storage::Receipt;

fn header() -> Header {
    let genesis = Header::genesis(Namespace::from_bytes([7u8; 32]), 0);
    Header::next(
        &genesis,
        HeaderType::Normal,
        Hash::digest_bytes(b"io"),
        Hash::digest_bytes(b"state"),
        6,
    )
}

fn bench_receipt_sign(c: &mut Criterion) {
    let keypair = Keypair::generate();
    let body = header().receipt_body();

    c.bench_function("receipt/sign", |b| {
        b.iter(|| Receipt::sign(&keypair, &body));
    });
}

fn bench_receipt_open(c: &mut Criterion) {
    let keypair = Keypair::generate();
    let receipt = Receipt::sign(&keypair, &header().receipt_body());

    c.bench_function("receipt/open", |b| {
        b.iter(|| receipt.open());
    });
}

fn bench_verify_receipt(c: &mut Criterion) {
    let keypair = Keypair::generate();
    let header = header();
    let receipt = Receipt::sign(&keypair, &header.receipt_body());
    let signer = keypair.public_key();

    c.bench_function("receipt/verify_against_header", |b| {
        b.iter(|| verify_receipt(&header, &receipt, Some(&signer)));
    });
}

fn bench_verify_signature_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("receipt/verify_signature_set");

    for committee in [1usize, 4, 16, 64] {
        let mut header = header();
        for _ in 0..committee {
            header.add_storage_signature(&Keypair::generate());
        }

        group.throughput(Throughput::Elements(committee as u64));
        group.bench_with_input(BenchmarkId::from_parameter(committee), &header, |b, h| {
            b.iter(|| verify_receipt_signatures(h));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_receipt_sign,
    bench_receipt_open,
    bench_verify_receipt,
    bench_verify_signature_set,
);
criterion_main!(benches);
