// Cross-process tests: the pool mapping is inherited over fork, which is
// exactly how sibling processes share these queues in production. The
// child reports through its exit status, since asserts there would only
// abort the forked copy.

mod common;

use common::fresh_pool;
use nix::libc;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use shmq::consts::QUEUE_CAPACITY;
use shmq::Queue;

#[test]
fn forked_producer_feeds_the_parent_consumer() {
    let _guard = fresh_pool();
    let mut queue = Queue::<i32>::create(true, QUEUE_CAPACITY).unwrap();
    let offset = queue.offset();

    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            let mut producer = Queue::<i32>::load(false, offset).unwrap();
            for i in -3000..=3000 {
                while !producer.enqueue(i) {
                    std::hint::spin_loop();
                }
            }
            unsafe { libc::_exit(0) };
        }
        ForkResult::Parent { child } => {
            let mut total = 0i64;
            for _ in 0..6001 {
                let value = loop {
                    if let Some(value) = queue.dequeue_next() {
                        break value;
                    }
                    std::hint::spin_loop();
                };
                total += i64::from(value);
            }

            assert_eq!(0, total);
            assert_eq!(
                WaitStatus::Exited(child, 0),
                waitpid(child, None).unwrap()
            );
        }
    }

    queue.free_queue();
}

#[test]
fn forked_consumer_drains_a_blocking_parent() {
    let _guard = fresh_pool();
    let queue = Queue::<i32>::create(false, QUEUE_CAPACITY).unwrap();
    let offset = queue.offset();

    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            let mut consumer = Queue::<i32>::load(true, offset).unwrap();
            let mut total = 0i64;
            for _ in 0..6001 {
                total += i64::from(consumer.dequeue_next_blocking());
            }
            unsafe { libc::_exit(if total == 0 { 0 } else { 1 }) };
        }
        ForkResult::Parent { child } => {
            let mut producer = Queue::<i32>::load(false, offset).unwrap();
            for i in -3000..=3000 {
                // False until the child registers its ring.
                while !producer.enqueue_blocking(i) {
                    std::hint::spin_loop();
                }
            }

            assert_eq!(
                WaitStatus::Exited(child, 0),
                waitpid(child, None).unwrap()
            );
        }
    }

    queue.free_queue();
}

#[test]
fn names_resolve_across_the_fork() {
    let _guard = fresh_pool();

    // Touch the registry before forking so both sides attach to the same
    // map rather than racing to create it.
    let mut parent_queue = Queue::<u32>::fetch("fork_named").unwrap();

    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            let mut producer = Queue::<u32>::fetch_producer("fork_named").unwrap();
            let ok = producer.enqueue_blocking(4242);
            unsafe { libc::_exit(if ok { 0 } else { 1 }) };
        }
        ForkResult::Parent { child } => {
            assert_eq!(4242, parent_queue.dequeue_next_blocking());
            assert_eq!(
                WaitStatus::Exited(child, 0),
                waitpid(child, None).unwrap()
            );
        }
    }

    parent_queue.free_queue();
}
