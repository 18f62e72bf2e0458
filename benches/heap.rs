use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use memmap2::MmapMut;
use tempfile::tempdir;

use ipc_mq::core::heap::required_region_size;
use ipc_mq::{QueueConfig, SharedHeap, SharedQueue};

const CAPACITY: usize = 1024;

fn bench_heap_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_push_pop");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let len = required_region_size(CAPACITY, size).expect("region size");
                    let region = MmapMut::map_anon(len).expect("map_anon");
                    let heap = SharedHeap::create(region, CAPACITY, size).expect("heap");
                    (heap, vec![0u8; size], vec![0u8; size])
                },
                |(mut heap, payload, mut buf)| {
                    for i in 0..CAPACITY {
                        let prio = (i.wrapping_mul(2_654_435_761) % 1000) as i32;
                        heap.push(prio, black_box(&payload)).expect("push");
                    }
                    while heap.exclusive_len() > 0 {
                        black_box(heap.pop(&mut buf).expect("pop"));
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_queue_round_trip(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("bench_queue");
    let mut queue = SharedQueue::create(&path, &QueueConfig::new(16, 256)).expect("queue");
    let payload = vec![0u8; 256];
    let mut buf = vec![0u8; 256];

    c.bench_function("shared_queue_send_receive", |b| {
        b.iter(|| {
            queue.send(black_box(&payload), 1).expect("send");
            black_box(queue.receive(&mut buf).expect("receive"));
        });
    });
}

criterion_group!(benches, bench_heap_push_pop, bench_queue_round_trip);
criterion_main!(benches);
