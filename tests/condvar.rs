mod support;

use hyphae::{Condvar, Lock, Priority};
use hyphae_sim::{JoinHandle, Kernel};
use std::sync::Arc;
use support::Log;

struct Fixture {
    lock: Arc<Lock>,
    cond: Arc<Condvar>,
    log: Log,
    handles: Vec<JoinHandle>,
}

impl Fixture {
    /// Lowers `main` below every waiter, then spawns one waiter per priority.
    /// Each waiter blocks on the condition variable before `main` runs again.
    fn new(k: &Kernel, priorities: &[u8]) -> Self {
        let lock = Arc::new(Lock::new());
        let cond = Arc::new(Condvar::new());
        let log = Log::new();
        k.set_priority(Priority::MIN);

        let handles = priorities
            .iter()
            .map(|&p| {
                let (lock, cond, log) = (lock.clone(), cond.clone(), log.clone());
                k.spawn(format!("p{p}"), Priority::new(p), move |k| {
                    lock.acquire(k);
                    cond.wait(&lock, k);
                    log.push(format!("p{p}"));
                    lock.release(k);
                })
                .unwrap()
            })
            .collect();
        assert_eq!(cond.waiter_count(k), priorities.len());

        Self {
            lock,
            cond,
            log,
            handles,
        }
    }

    fn join(self, k: &Kernel) {
        for handle in self.handles {
            handle.join(k);
        }
    }
}

#[test]
fn signal_wakes_highest_priority_first() {
    let _trace = hyphae_sim::trace_init();
    hyphae_sim::run(|k| {
        let fixture = Fixture::new(k, &[2, 7, 4]);
        for _ in 0..3 {
            fixture.lock.acquire(k);
            fixture.cond.signal(&fixture.lock, k);
            fixture.lock.release(k);
        }
        assert_eq!(fixture.log.events(), ["p7", "p4", "p2"]);
        fixture.join(k);
    });
}

#[test]
fn broadcast_wakes_in_priority_order() {
    let _trace = hyphae_sim::trace_init();
    hyphae_sim::run(|k| {
        let fixture = Fixture::new(k, &[2, 7, 4]);
        fixture.lock.acquire(k);
        fixture.cond.broadcast(&fixture.lock, k);
        assert_eq!(fixture.cond.waiter_count(k), 0);
        fixture.lock.release(k);

        assert_eq!(fixture.log.events(), ["p7", "p4", "p2"]);
        fixture.join(k);
    });
}

#[test]
fn signal_without_waiters_does_nothing() {
    hyphae_sim::run(|k| {
        let lock = Lock::new();
        let cond = Condvar::new();
        lock.acquire(k);
        cond.signal(&lock, k);
        cond.broadcast(&lock, k);
        assert_eq!(cond.waiter_count(k), 0);
        lock.release(k);
    });
}

/// A bounded buffer in which producers and consumers wait on separate
/// conditions that share one lock.
#[test]
fn bounded_buffer() {
    const ITEMS: usize = 20;
    const CAPACITY: usize = 3;

    struct Buffer {
        lock: Lock,
        not_full: Condvar,
        not_empty: Condvar,
        items: std::sync::Mutex<Vec<usize>>,
    }

    fn len(buf: &Buffer) -> usize {
        buf.items.lock().unwrap().len()
    }

    let _trace = hyphae_sim::trace_init();
    hyphae_sim::run(|k| {
        let buf = Arc::new(Buffer {
            lock: Lock::new(),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            items: std::sync::Mutex::new(Vec::new()),
        });

        let consumer = {
            let buf = buf.clone();
            k.spawn("consumer", Priority::new(35), move |k| {
                let mut received = Vec::new();
                for _ in 0..ITEMS {
                    buf.lock.acquire(k);
                    while len(&buf) == 0 {
                        buf.not_empty.wait(&buf.lock, k);
                    }
                    received.push(buf.items.lock().unwrap().remove(0));
                    buf.not_full.signal(&buf.lock, k);
                    buf.lock.release(k);
                }
                assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
            })
            .unwrap()
        };

        for item in 0..ITEMS {
            buf.lock.acquire(k);
            while len(&buf) == CAPACITY {
                buf.not_full.wait(&buf.lock, k);
            }
            buf.items.lock().unwrap().push(item);
            buf.not_empty.signal(&buf.lock, k);
            buf.lock.release(k);
        }
        consumer.join(k);
    });
}

#[test]
#[should_panic(expected = "without holding")]
fn signal_without_lock_is_fatal() {
    hyphae_sim::run(|k| {
        Condvar::new().signal(&Lock::new(), k);
    });
}

#[test]
#[should_panic(expected = "without holding")]
fn broadcast_without_lock_is_fatal() {
    hyphae_sim::run(|k| {
        Condvar::new().broadcast(&Lock::new(), k);
    });
}

#[test]
#[should_panic(expected = "without holding")]
fn wait_without_lock_is_fatal() {
    hyphae_sim::run(|k| {
        Condvar::new().wait(&Lock::new(), k);
    });
}
