//! Benchmarks the channel kernel's matching path: rendezvous ping-pong,
//! buffered throughput, and selection overhead across a handful of
//! candidates. Run with `cargo bench`.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use csp_kernel::{Channel, ChannelConfig, Deadline, Priority, read_from_any};
use tokio::runtime::Runtime;

fn rt() -> Runtime {
    Runtime::new().expect("build tokio runtime for benchmark")
}

fn bench_rendezvous_ping_pong(c: &mut Criterion) {
    let rt = rt();
    c.bench_function("rendezvous_ping_pong", |b| {
        b.to_async(&rt).iter(|| async {
            let channel = Channel::<u64>::new(ChannelConfig::default()).unwrap();
            let writer = {
                let channel = channel.clone();
                tokio::spawn(async move { channel.write(1, None, Deadline::Infinite).await })
            };
            let value = channel.read(None, Deadline::Infinite).await.unwrap();
            writer.await.unwrap().unwrap();
            value
        });
    });
}

fn bench_buffered_write_read(c: &mut Criterion) {
    let rt = rt();
    let mut group = c.benchmark_group("buffered_write_read");
    for buffer in [1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(buffer), &buffer, |b, &buffer| {
            b.to_async(&rt).iter(|| async move {
                let channel = Channel::<u64>::new(ChannelConfig::default().with_buffer(buffer)).unwrap();
                for i in 0..buffer as u64 {
                    channel.write(i, None, Deadline::Immediate).await.unwrap();
                }
                for _ in 0..buffer {
                    channel.read(None, Deadline::Immediate).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_select_first_among_n(c: &mut Criterion) {
    let rt = rt();
    let mut group = c.benchmark_group("select_first_among_n");
    for n in [2usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.to_async(&rt).iter(|| async move {
                let channels: Vec<Channel<u64>> = (0..n).map(|_| Channel::new(ChannelConfig::default().with_buffer(1)).unwrap()).collect();
                channels[n - 1].write(7, None, Deadline::Immediate).await.unwrap();
                let refs: Vec<&Channel<u64>> = channels.iter().collect();
                read_from_any(&refs, Priority::First, Deadline::Immediate).await.unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(matching, bench_rendezvous_ping_pong, bench_buffered_write_read, bench_select_first_among_n);
criterion_main!(matching);
