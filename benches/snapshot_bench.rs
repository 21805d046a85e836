/*
Measures the snapshot fabric hot path: publish on the producer side and the
wait-free latest() read the render loop performs for every source on every
frame, alone and under a concurrent producer.
*/

use criterion::{criterion_group, criterion_main, Criterion};

use std::{
    hint::black_box,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use opentpt::runtime::SnapshotSlot;

#[derive(Clone, Copy)]
#[allow(dead_code)]
struct FixLike {
    lat: f64,
    lon: f64,
    speed: f64,
    seq: u64,
}

fn bench_publish(c: &mut Criterion) {
    let slot = SnapshotSlot::new();
    let mut n = 0u64;
    c.bench_function("slot_publish", |b| {
        b.iter(|| {
            n += 1;
            slot.publish(black_box(FixLike { lat: 50.0, lon: 8.0, speed: 100.0, seq: n }));
        })
    });
}

fn bench_latest_uncontended(c: &mut Criterion) {
    let slot = SnapshotSlot::new();
    slot.publish(FixLike { lat: 50.0, lon: 8.0, speed: 100.0, seq: 1 });
    c.bench_function("slot_latest_uncontended", |b| {
        b.iter(|| black_box(slot.latest()))
    });
}

fn bench_latest_under_producer(c: &mut Criterion) {
    let slot = Arc::new(SnapshotSlot::new());
    let running = Arc::new(AtomicBool::new(true));

    let producer = {
        let slot = Arc::clone(&slot);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut n = 0u64;
            while running.load(Ordering::Acquire) {
                n += 1;
                slot.publish(FixLike { lat: 50.0, lon: 8.0, speed: 100.0, seq: n });
            }
        })
    };

    c.bench_function("slot_latest_with_live_producer", |b| {
        b.iter(|| black_box(slot.latest()))
    });

    running.store(false, Ordering::Release);
    let _ = producer.join();
}

criterion_group!(
    benches,
    bench_publish,
    bench_latest_uncontended,
    bench_latest_under_producer
);
criterion_main!(benches);
