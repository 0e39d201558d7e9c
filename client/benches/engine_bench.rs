// Hot-path benchmarks for the ledger client.
//
// Covers endpoint parsing, candidate selection over networks of various
// sizes, per-node transaction signing, and chunked message reassembly.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ledger_client::network::{Topology, TopologyOptions};
use ledger_client::signing::{Ed25519Signer, Signer};
use ledger_client::subscription::{ChunkBuffer, ChunkInfo, Timestamp, TopicResponse};
use ledger_client::transaction::SubmitTransaction;
use ledger_client::transport::{LocalTransport, Transport};
use ledger_client::{AccountId, Endpoint};

/// A topology of `n` nodes, none of them reachable.
fn topology(n: u64) -> Topology<AccountId> {
    let transport = Arc::new(LocalTransport::new()) as Arc<dyn Transport>;
    let topology = Topology::new(transport, TopologyOptions::default());
    topology.replace_network((0..n).map(|i| {
        (
            Endpoint::remote(format!("10.0.{}.{}", i / 256, i % 256), 50211),
            AccountId::from_num(3 + i),
        )
    }));
    topology
}

fn bench_endpoint_parse(c: &mut Criterion) {
    c.bench_function("endpoint/parse", |b| {
        b.iter(|| "node01.testnet.example:50212".parse::<Endpoint>());
    });
}

fn bench_select_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology/select_nodes");
    for size in [10u64, 100, 1000] {
        let topology = topology(size);
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| topology.select_nodes());
        });
    }
    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let signer: Arc<dyn Signer> = Arc::new(Ed25519Signer::from_seed(&[9u8; 32]));
    let tx = SubmitTransaction::new(vec![0xAB; 256]).sign_with(signer);
    let node = AccountId::from_num(3);

    c.bench_function("transaction/envelope", |b| {
        b.iter(|| tx.envelope(&node));
    });
}

fn bench_chunk_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscription/reassemble");
    for total in [2u32, 20] {
        let chunks: Vec<TopicResponse> = (1..=total)
            .rev()
            .map(|number| TopicResponse {
                consensus_timestamp: Timestamp::new(100, number),
                sequence_number: number as u64,
                running_hash: Bytes::from_static(&[0u8; 48]),
                contents: Bytes::from(vec![number as u8; 1024]),
                chunk: Some(ChunkInfo {
                    initial_transaction_id: "0.0.2@100.0".into(),
                    number,
                    total,
                }),
            })
            .collect();
        group.throughput(Throughput::Elements(total as u64));
        group.bench_with_input(BenchmarkId::from_parameter(total), &chunks, |b, chunks| {
            b.iter(|| {
                let mut buffer = ChunkBuffer::new();
                chunks
                    .iter()
                    .cloned()
                    .filter_map(|chunk| buffer.accept(chunk))
                    .count()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_endpoint_parse,
    bench_select_nodes,
    bench_envelope,
    bench_chunk_reassembly,
);
criterion_main!(benches);
