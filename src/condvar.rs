//! A Mesa-style condition variable.
use crate::{
    lock::Lock,
    sched::{assert_can_block, Scheduler},
    section::{AtomicSection, SectionCell},
    semaphore::Semaphore,
    thread::ThreadId,
};
use alloc::{sync::Arc, vec::Vec};
use core::{cmp::Reverse, fmt};

/// A condition variable.
///
/// A condition variable lets a thread atomically release a [`Lock`] and
/// wait until another thread signals that some condition may have become
/// true. It is always used together with a lock, which must be held across
/// every call; one lock may be shared by several condition variables.
///
/// Signals are delivered Mesa-style: a woken thread reacquires the lock
/// like any other thread, so by the time it runs the condition may no longer
/// hold. Callers should wait in a loop:
///
/// ```ignore
/// lock.acquire(sched);
/// while !condition() {
///     condvar.wait(&lock, sched);
/// }
/// // ... the condition holds, and the lock is held ...
/// lock.release(sched);
/// ```
///
/// Signaling a condition variable with no waiters does nothing.
///
/// # Wake order
///
/// [`signal`](Self::signal) wakes the waiting thread with the highest
/// effective priority at the time of the signal. Waiters with equal priority
/// are woken in the order they started waiting.
pub struct Condvar {
    waiters: SectionCell<Vec<Waiter>>,
}

/// A thread blocked in [`Condvar::wait`], and the private semaphore it is
/// blocked on.
struct Waiter {
    thread: ThreadId,
    semaphore: Arc<Semaphore>,
}

impl Condvar {
    /// Returns a new condition variable with no waiters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: SectionCell::new(Vec::new()),
        }
    }

    /// Atomically releases `lock` and waits to be signaled, then reacquires
    /// `lock` before returning.
    ///
    /// # Panics
    ///
    /// - If called from interrupt context.
    /// - If the current thread does not hold `lock`.
    #[track_caller]
    pub fn wait<S: Scheduler + ?Sized>(&self, lock: &Lock, sched: &S) {
        assert_can_block(sched, "Condvar::wait");
        let me = sched.current_thread();
        let semaphore = AtomicSection::scope(sched, |section| {
            assert_holds(section, lock, "Condvar::wait");

            let semaphore = Arc::new(Semaphore::new(0));
            self.waiters.with(section, |waiters| {
                waiters.push(Waiter {
                    thread: me,
                    semaphore: semaphore.clone(),
                })
            });
            semaphore
        });

        trace!(thread = ?me, lock = ?lock.id(), "Condvar::wait -> waiting");
        lock.release(sched);
        semaphore.down(sched);
        trace!(thread = ?me, lock = ?lock.id(), "Condvar::wait -> signaled");
        lock.acquire(sched);
    }

    /// Wakes the highest-priority thread waiting on this condition
    /// variable, if any.
    ///
    /// # Panics
    ///
    /// If the current thread does not hold `lock`.
    #[track_caller]
    pub fn signal<S: Scheduler + ?Sized>(&self, lock: &Lock, sched: &S) {
        AtomicSection::scope(sched, |section| {
            assert_holds(section, lock, "Condvar::signal");
            self.signal_in(section);
        });
    }

    /// Wakes every thread waiting on this condition variable, in priority
    /// order.
    ///
    /// # Panics
    ///
    /// If the current thread does not hold `lock`.
    #[track_caller]
    pub fn broadcast<S: Scheduler + ?Sized>(&self, lock: &Lock, sched: &S) {
        AtomicSection::scope(sched, |section| {
            assert_holds(section, lock, "Condvar::broadcast");
            while self.signal_in(section) {}
        });
    }

    /// Returns the number of threads waiting on this condition variable.
    pub fn waiter_count<S: Scheduler + ?Sized>(&self, sched: &S) -> usize {
        AtomicSection::scope(sched, |section| {
            self.waiters.with(section, |waiters| waiters.len())
        })
    }

    /// Wakes the highest-priority waiter. Returns `false` if there were no
    /// waiters.
    fn signal_in<S: Scheduler + ?Sized>(&self, section: &AtomicSection<'_, S>) -> bool {
        let woken = self.waiters.with(section, |waiters| {
            if waiters.is_empty() {
                return None;
            }
            section.with_threads(|threads| {
                waiters.sort_by_key(|waiter| Reverse(threads.priority(waiter.thread)))
            });
            Some(waiters.remove(0))
        });

        match woken {
            Some(Waiter { thread, semaphore }) => {
                trace!(?thread, "Condvar::signal -> waking");
                semaphore.up_in(section);
                true
            }
            None => false,
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters)
            .finish()
    }
}

#[track_caller]
fn assert_holds<S: Scheduler + ?Sized>(section: &AtomicSection<'_, S>, lock: &Lock, operation: &str) {
    let me = section.scheduler().current_thread();
    let holder = section.with_threads(|threads| threads.holder_of(lock.id()));
    assert_eq!(
        holder,
        Some(me),
        "{operation} called by thread {me:?} without holding {:?}",
        lock.id()
    );
}
