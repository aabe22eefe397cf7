mod common;

use std::thread;

use common::fresh_pool;
use shmq::consts::QUEUE_CAPACITY;
use shmq::{Error, MpscRing};

// Producers in these tests attach their own handle by offset; a ring
// handle must never be shared between threads.

fn producer(offset: u32) {
    let mut ring = MpscRing::<i32>::load(offset);
    for i in -3000..=3000 {
        // Non-blocking writes spin until there is room.
        while !ring.enqueue(i) {
            std::hint::spin_loop();
        }
    }
}

fn blocking_producer(offset: u32) {
    let mut ring = MpscRing::<i32>::load(offset);
    for i in -3000..=3000 {
        ring.enqueue_blocking(i);
    }
}

fn alternating_producer(offset: u32) {
    let mut ring = MpscRing::<i32>::load(offset);
    for i in -3000..=3000 {
        if i % 2 != 0 {
            ring.enqueue_blocking(i);
        } else {
            while !ring.enqueue(i) {
                std::hint::spin_loop();
            }
        }
    }
}

fn consume_sum(ring: &mut MpscRing<i32>, num_producers: usize) -> i64 {
    let mut total = 0i64;
    for _ in 0..6001 * num_producers {
        let value = loop {
            if let Some(value) = ring.dequeue_next() {
                break value;
            }
            std::hint::spin_loop();
        };
        total += i64::from(value);
    }
    total
}

fn consume_sum_blocking(ring: &mut MpscRing<i32>, num_producers: usize) -> i64 {
    let mut total = 0i64;
    for _ in 0..6001 * num_producers {
        total += i64::from(ring.dequeue_next_blocking());
    }
    total
}

#[test]
fn capacity_must_be_a_power_of_two() {
    let _guard = fresh_pool();

    assert!(matches!(
        MpscRing::<i32>::create(3),
        Err(Error::CapacityNotPowerOfTwo(3))
    ));
    assert!(MpscRing::<i32>::create(1).is_ok());
}

#[test]
fn fills_to_capacity_and_no_further() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();

    for i in 0..QUEUE_CAPACITY as i32 {
        assert!(ring.enqueue(i));
    }

    assert!(!ring.enqueue(51));
}

#[test]
fn dequeues_in_fifo_order() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();

    for i in 0..10 {
        assert!(ring.enqueue(i));
    }

    for i in 0..10 {
        assert_eq!(Some(i), ring.dequeue_next());
    }

    assert_eq!(None, ring.dequeue_next());
}

#[test]
fn interleaved_enqueue_dequeue_keeps_order() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();

    let mut expected = 0;
    for i in (0..20).step_by(2) {
        assert!(ring.enqueue(i));
        assert!(ring.enqueue(i + 1));

        assert_eq!(Some(expected), ring.dequeue_next());
        expected += 1;
    }

    for _ in 0..10 {
        assert_eq!(Some(expected), ring.dequeue_next());
        expected += 1;
    }

    assert_eq!(None, ring.dequeue_next());
}

#[test]
fn struct_payloads_round_trip() {
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Payload {
        foo: i32,
        bar: u8,
        baz: f64,
    }

    let _guard = fresh_pool();
    let mut ring = MpscRing::<Payload>::create(QUEUE_CAPACITY).unwrap();

    for i in 0..20 {
        assert!(ring.enqueue(Payload {
            foo: i,
            bar: b'a',
            baz: 42.0,
        }));
    }

    for i in 0..20 {
        let got = ring.dequeue_next().unwrap();
        assert_eq!(
            Payload {
                foo: i,
                bar: b'a',
                baz: 42.0,
            },
            got
        );
    }

    assert_eq!(None, ring.dequeue_next());
}

#[test]
fn spsc_sequence_sums_to_zero() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();
    let offset = ring.offset();

    let handle = thread::spawn(move || producer(offset));

    assert_eq!(0, consume_sum(&mut ring, 1));
    handle.join().unwrap();
}

#[test]
fn fifty_producers_sum_to_zero() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();
    let offset = ring.offset();

    let producers: Vec<_> = (0..50).map(|_| thread::spawn(move || producer(offset))).collect();

    assert_eq!(0, consume_sum(&mut ring, 50));

    for handle in producers {
        handle.join().unwrap();
    }
}

#[test]
fn blocking_spsc_sums_to_zero() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();
    let offset = ring.offset();

    let handle = thread::spawn(move || blocking_producer(offset));

    assert_eq!(0, consume_sum_blocking(&mut ring, 1));
    handle.join().unwrap();
}

#[test]
fn blocking_producers_all_get_served() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();
    let offset = ring.offset();

    let producers: Vec<_> = (0..60)
        .map(|_| thread::spawn(move || blocking_producer(offset)))
        .collect();

    assert_eq!(0, consume_sum_blocking(&mut ring, 60));

    for handle in producers {
        handle.join().unwrap();
    }
}

#[test]
fn mixed_blocking_and_nonblocking_operations() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();
    let offset = ring.offset();

    let handle = thread::spawn(move || alternating_producer(offset));

    let mut total = 0i64;
    for i in 0..6001 {
        let value = if i % 2 != 0 {
            ring.dequeue_next_blocking()
        } else {
            loop {
                if let Some(value) = ring.dequeue_next() {
                    break value;
                }
                std::hint::spin_loop();
            }
        };
        total += i64::from(value);
    }

    assert_eq!(0, total);
    handle.join().unwrap();
}

#[test]
fn single_slot_ring_alternates() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(1).unwrap();

    for i in 0..20 {
        assert!(ring.enqueue(i));
        assert!(!ring.enqueue(i + 1));

        assert_eq!(Some(i), ring.dequeue_next());
    }

    assert_eq!(None, ring.dequeue_next());
}

#[test]
fn single_slot_ring_spsc() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(1).unwrap();
    let offset = ring.offset();

    let handle = thread::spawn(move || producer(offset));

    assert_eq!(0, consume_sum(&mut ring, 1));
    handle.join().unwrap();
}

#[test]
fn peek_matches_the_following_dequeue() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();

    assert_eq!(None, ring.peek_next());

    for i in 0..10 {
        assert!(ring.enqueue(i));
    }

    for i in 0..10 {
        assert_eq!(Some(i), ring.peek_next());
        // Peeking does not consume; the same value must still be there.
        assert_eq!(Some(i), ring.peek_next());
        assert_eq!(Some(i), ring.dequeue_next());
    }
}

#[test]
fn peeking_consumer_reads_everything_twice() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();
    let offset = ring.offset();

    let handle = thread::spawn(move || producer(offset));

    let mut total = 0i64;
    for _ in 0..6001 {
        let peeked = loop {
            if let Some(value) = ring.peek_next() {
                break value;
            }
            std::hint::spin_loop();
        };
        total += i64::from(peeked);

        // A successful peek guarantees the dequeue succeeds.
        let value = ring.dequeue_next().expect("peeked item vanished");
        total += i64::from(value);
    }

    assert_eq!(0, total);
    handle.join().unwrap();
}

#[test]
fn blocking_peek_leaves_the_item_in_place() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(QUEUE_CAPACITY).unwrap();
    let offset = ring.offset();

    let handle = thread::spawn(move || blocking_producer(offset));

    let mut total = 0i64;
    for _ in 0..6001 {
        let peeked = ring.peek_next_blocking();
        total += i64::from(peeked);

        let value = ring.dequeue_next().expect("peeked item vanished");
        total += i64::from(value);
    }

    assert_eq!(0, total);
    handle.join().unwrap();
}

#[test]
fn reservations_commit_or_cancel() {
    let _guard = fresh_pool();
    let mut ring = MpscRing::<i32>::create(4).unwrap();

    assert!(ring.reserve());
    ring.enqueue_at(7);

    // A cancelled reservation gives the slot back.
    assert!(ring.reserve());
    ring.cancel_reservation();

    for i in 0..3 {
        assert!(ring.enqueue(10 + i));
    }
    // One element plus three fills the ring of four.
    assert!(!ring.enqueue(99));

    assert_eq!(Some(7), ring.dequeue_next());
    assert_eq!(Some(10), ring.dequeue_next());
    assert_eq!(Some(11), ring.dequeue_next());
    assert_eq!(Some(12), ring.dequeue_next());
    assert_eq!(None, ring.dequeue_next());
}
