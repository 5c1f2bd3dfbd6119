use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relayd::protocol::frame::{decode, encode};
use relayd::protocol::{DEFAULT_MAX_FRAME_LENGTH, MESSAGE_TYPE};
use relayd::registry::{ConnectionHandle, ConnectionRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PAYLOAD_SIZES: [usize; 4] = [16, 256, 4096, 65536];

fn benchmark_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in PAYLOAD_SIZES {
        let payload = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let mut buf = BytesMut::with_capacity(size + 5);
            b.iter(|| {
                buf.clear();
                encode(MESSAGE_TYPE, payload, &mut buf).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in PAYLOAD_SIZES {
        let mut encoded = BytesMut::new();
        encode(MESSAGE_TYPE, &vec![0xCDu8; size], &mut encoded).unwrap();
        let encoded = encoded.freeze();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                decode(&mut buf, DEFAULT_MAX_FRAME_LENGTH).unwrap().unwrap()
            });
        });
    }

    group.finish();
}

fn benchmark_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_broadcast");

    for connections in [1usize, 10, 100, 1000] {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::with_capacity(connections);
        for i in 0..connections {
            let (tx, rx) = mpsc::channel(1024);
            registry.add(ConnectionHandle::new(
                format!("conn_{i}"),
                None,
                tx,
                CancellationToken::new(),
            ));
            receivers.push(rx);
        }

        let mut frame = BytesMut::new();
        encode(MESSAGE_TYPE, b"broadcast payload", &mut frame).unwrap();
        let frame: Bytes = frame.freeze();

        group.throughput(Throughput::Elements(connections as u64));
        group.bench_function(BenchmarkId::from_parameter(connections), |b| {
            b.iter(|| {
                let report = registry.broadcast(frame.clone());
                // Keep the queues from filling up and evicting everyone
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
                report
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_encode, benchmark_decode, benchmark_broadcast);
criterion_main!(benches);
