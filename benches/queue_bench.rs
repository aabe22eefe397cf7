use std::sync::Once;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};
use nix::libc;
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
use shmq::consts::QUEUE_CAPACITY;
use shmq::{MpscRing, Pool, Queue};

// Leftover regions from earlier runs would skew allocations; start each
// bench process against a fresh pool.
fn fresh_pool() {
    static SETUP: Once = Once::new();
    SETUP.call_once(|| {
        Pool::unlink();
        Pool::get();
    });
}

fn ring_round_trip(c: &mut Criterion) {
    fresh_pool();

    let mut ring = MpscRing::<u64>::create(QUEUE_CAPACITY).unwrap();

    c.bench_function("ring_round_trip", |b| {
        b.iter(|| {
            ring.enqueue(std::hint::black_box(1));
            ring.dequeue_next()
        })
    });

    ring.free();
}

fn fanout_round_trip(c: &mut Criterion) {
    fresh_pool();

    let mut queue = Queue::<u64>::create(true, QUEUE_CAPACITY).unwrap();

    c.bench_function("fanout_round_trip", |b| {
        b.iter(|| {
            queue.enqueue(std::hint::black_box(1));
            queue.dequeue_next()
        })
    });

    queue.free_queue();
}

// Forked SPSC throughput through the fan-out queue: the child spins items
// in, the parent times draining them.
fn fanout_spsc_fork(c: &mut Criterion) {
    fresh_pool();

    let mut group = c.benchmark_group("fanout_spsc");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));

    group.bench_function("fork", |b| {
        b.iter_custom(|iters| {
            let mut consumer = Queue::<u64>::create(true, QUEUE_CAPACITY).unwrap();
            let offset = consumer.offset();

            match unsafe { fork() }.expect("fork failed") {
                ForkResult::Child => {
                    let mut producer = Queue::<u64>::load(false, offset).unwrap();
                    for i in 0..iters {
                        while !producer.enqueue(i) {
                            std::hint::spin_loop();
                        }
                    }
                    unsafe { libc::_exit(0) };
                }
                ForkResult::Parent { child } => {
                    let start = Instant::now();
                    for _ in 0..iters {
                        while consumer.dequeue_next().is_none() {
                            std::hint::spin_loop();
                        }
                    }
                    let elapsed = start.elapsed();

                    waitpid(child, None).unwrap();
                    consumer.free_queue();

                    elapsed
                }
            }
        })
    });

    group.finish();
}

criterion_group!(benches, ring_round_trip, fanout_round_trip, fanout_spsc_fork);
criterion_main!(benches);
