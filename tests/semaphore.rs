mod support;

use hyphae::{Priority, Semaphore};
use proptest::prelude::*;
use std::sync::Arc;
use support::Log;

#[test]
fn wakes_highest_priority_first() {
    let _trace = hyphae_sim::trace_init();
    let log = Log::new();
    hyphae_sim::run(|k| {
        let sema = Arc::new(Semaphore::new(0));
        let mut handles = Vec::new();
        for p in [3, 9, 5] {
            let (sema, log) = (sema.clone(), log.clone());
            let handle = k
                .spawn(format!("p{p}"), Priority::new(p), move |k| {
                    sema.down(k);
                    log.push(format!("p{p}"));
                })
                .unwrap();
            handles.push(handle);
        }

        k.set_priority(Priority::MIN);
        assert_eq!(sema.waiter_count(k), 3);

        for _ in 0..3 {
            sema.up(k);
        }
        assert_eq!(log.events(), ["p9", "p5", "p3"]);
        assert_eq!(sema.count(k), 0);

        for handle in handles {
            handle.join(k);
        }
    });
}

#[test]
fn equal_priorities_wake_in_arrival_order() {
    let _trace = hyphae_sim::trace_init();
    let log = Log::new();
    hyphae_sim::run(|k| {
        let sema = Arc::new(Semaphore::new(0));
        let mut handles = Vec::new();
        for name in ["first", "second", "third"] {
            let (sema, log) = (sema.clone(), log.clone());
            handles.push(
                k.spawn(name, Priority::new(40), move |k| {
                    sema.down(k);
                    log.push(name);
                })
                .unwrap(),
            );
        }

        for _ in 0..3 {
            sema.up(k);
        }
        assert_eq!(log.events(), ["first", "second", "third"]);

        for handle in handles {
            handle.join(k);
        }
    });
}

/// Two threads hand control back and forth through a pair of semaphores.
#[test]
fn ping_pong() {
    const ROUNDS: usize = 10;
    let _trace = hyphae_sim::trace_init();
    hyphae_sim::run(|k| {
        let ping = Arc::new(Semaphore::new(0));
        let pong = Arc::new(Semaphore::new(0));

        let helper = {
            let (ping, pong) = (ping.clone(), pong.clone());
            k.spawn("sema-test", Priority::DEFAULT, move |k| {
                for _ in 0..ROUNDS {
                    ping.down(k);
                    pong.up(k);
                }
            })
            .unwrap()
        };

        for _ in 0..ROUNDS {
            ping.up(k);
            pong.down(k);
        }
        helper.join(k);

        assert_eq!(ping.count(k), 0);
        assert_eq!(pong.count(k), 0);
        assert_eq!(ping.waiter_count(k), 0);
        assert_eq!(pong.waiter_count(k), 0);
    });
}

#[test]
fn try_down_at_zero_is_idempotent() {
    hyphae_sim::run(|k| {
        let sema = Semaphore::new(0);
        for _ in 0..4 {
            assert!(!sema.try_down(k));
            assert_eq!(sema.count(k), 0);
        }

        let sema = Semaphore::new(2);
        assert!(sema.try_down(k));
        assert!(sema.try_down(k));
        assert!(!sema.try_down(k));
        assert_eq!(sema.count(k), 0);
    });
}

#[test]
#[should_panic(expected = "deadlock")]
fn down_with_no_other_threads_deadlocks() {
    hyphae_sim::run(|k| {
        Semaphore::new(0).down(k);
    });
}

#[derive(Clone, Copy, Debug)]
enum Op {
    Up,
    Down,
    TryDown,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Up), Just(Op::Down), Just(Op::TryDown)]
}

proptest! {
    #[test]
    fn count_tracks_ups_and_downs(initial in 0usize..4, ops in proptest::collection::vec(op(), 0..64)) {
        hyphae_sim::run(|k| {
            let sema = Semaphore::new(initial);
            let (mut ups, mut downs) = (0, 0);
            for op in ops {
                let expected = initial + ups - downs;
                match op {
                    Op::Up => {
                        sema.up(k);
                        ups += 1;
                    }
                    // A blocking `down` with nobody to `up` would deadlock.
                    Op::Down if expected > 0 => {
                        sema.down(k);
                        downs += 1;
                    }
                    Op::Down => {}
                    Op::TryDown => {
                        let took = sema.try_down(k);
                        assert_eq!(took, expected > 0);
                        if took {
                            downs += 1;
                        }
                    }
                }
                assert_eq!(sema.count(k), initial + ups - downs);
            }
            assert_eq!(sema.waiter_count(k), 0);
        });
    }
}
