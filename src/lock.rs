//! A non-recursive, owned mutual-exclusion lock with priority donation.
use crate::{
    donation,
    sched::{assert_can_block, Scheduler},
    section::AtomicSection,
    semaphore::Semaphore,
    thread::{ThreadId, Threads},
};
use core::fmt;
use portable_atomic::{AtomicU64, Ordering::Relaxed};

/// A unique identifier for a [`Lock`].
///
/// Thread records refer to the lock a thread is blocked on by its `LockId`,
/// and the [thread table](crate::thread::Threads) maps each held lock's id
/// to its holder.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LockId(u64);

/// A mutual-exclusion lock.
///
/// At most one thread holds a `Lock` at a time, and only the holder may
/// release it. A lock is not recursive: a thread that tries to acquire a
/// lock it already holds has deadlocked itself, which is fatal.
///
/// # Priority donation
///
/// When the active [`SchedulingMode`] is
/// [`PriorityDonation`](crate::SchedulingMode::PriorityDonation), a thread
/// that blocks in [`acquire`](Self::acquire) lends its priority to the
/// holder, and through the holder to whatever the holder is itself waiting
/// on. The donation is withdrawn when the holder [`release`](Self::release)s
/// this lock, at which point the holder's priority falls back to the
/// greater of its base priority and the donations it still receives through
/// other locks. See the [`donation`](crate::donation) module for details.
///
/// [`SchedulingMode`]: crate::SchedulingMode
pub struct Lock {
    id: LockId,
    semaphore: Semaphore,
}

// === impl LockId ===

impl LockId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Relaxed))
    }

    /// Returns the numeric value of this identifier.
    #[inline]
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockId({})", self.0)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock {}", self.0)
    }
}

// === impl Lock ===

impl Lock {
    /// Returns a new, unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: LockId::next(),
            semaphore: Semaphore::new(1),
        }
    }

    /// Returns this lock's identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquires the lock, waiting until it is available.
    ///
    /// # Panics
    ///
    /// - If called from interrupt context.
    /// - If the current thread already holds this lock.
    #[track_caller]
    pub fn acquire<S: Scheduler + ?Sized>(&self, sched: &S) {
        assert_can_block(sched, "Lock::acquire");
        let section = unsafe {
            // Safety: `section` lives until the end of this function, and
            // every section entered below it ends first.
            AtomicSection::enter(sched)
        };
        let me = sched.current_thread();
        let lock = self.id;
        let donates = sched.mode().donates();

        loop {
            // Register as a waiter each time around: if we were woken but
            // another thread took the lock first, the new holder needs our
            // donation.
            section.with_threads(|threads| {
                let holder = threads.holder_of(lock);
                assert_ne!(
                    holder,
                    Some(me),
                    "thread {me:?} tried to acquire {lock:?}, which it already holds"
                );
                if let Some(holder) = holder {
                    threads.set_waiting_on(me, Some(lock));
                    donation::add_donor(threads, holder, me);
                    if donates {
                        let hops = donation::donate(threads, me);
                        trace!(thread = ?me, ?holder, ?lock, hops, "Lock::acquire -> donated");
                    }
                }
            });

            if self.semaphore.down_or_block(&section) {
                break;
            }
        }

        section.with_threads(|threads| {
            threads.set_waiting_on(me, None);
            take_ownership(threads, me, lock, donates);
        });
        debug!(thread = ?me, ?lock, "Lock::acquire -> acquired");
    }

    /// Acquires the lock if it is available, without waiting.
    ///
    /// Returns `true` if the lock was acquired. This never blocks and never
    /// donates, so it may be called from interrupt context.
    ///
    /// # Panics
    ///
    /// If the current thread already holds this lock.
    #[track_caller]
    pub fn try_acquire<S: Scheduler + ?Sized>(&self, sched: &S) -> bool {
        let section = unsafe {
            // Safety: `section` lives until the end of this function, and
            // every section entered below it ends first.
            AtomicSection::enter(sched)
        };
        let me = sched.current_thread();
        let lock = self.id;
        let held_by_me = section.with_threads(|threads| threads.holder_of(lock) == Some(me));
        assert!(
            !held_by_me,
            "thread {me:?} tried to acquire {lock:?}, which it already holds"
        );

        if !self.semaphore.try_down_in(&section) {
            trace!(thread = ?me, ?lock, "Lock::try_acquire -> unavailable");
            return false;
        }

        let donates = sched.mode().donates();
        section.with_threads(|threads| take_ownership(threads, me, lock, donates));
        debug!(thread = ?me, ?lock, "Lock::try_acquire -> acquired");
        true
    }

    /// Releases the lock.
    ///
    /// Any priority donated to the current thread through this lock is
    /// withdrawn, and the highest-priority waiter (if any) is woken.
    ///
    /// # Panics
    ///
    /// If the current thread does not hold this lock.
    #[track_caller]
    pub fn release<S: Scheduler + ?Sized>(&self, sched: &S) {
        let section = unsafe {
            // Safety: `section` lives until the end of this function, and
            // every section entered below it ends first.
            AtomicSection::enter(sched)
        };
        let me = sched.current_thread();
        let lock = self.id;
        let donates = sched.mode().donates();

        section.with_threads(|threads| {
            let holder = threads.holder_of(lock);
            assert_eq!(
                holder,
                Some(me),
                "thread {me:?} tried to release {lock:?}, which it does not hold"
            );

            let withdrawn = donation::remove_donors_for(threads, me, lock);
            if donates {
                let priority = donation::update_donation(threads, me);
                trace!(thread = ?me, ?lock, withdrawn, %priority, "Lock::release -> updated donation");
            }
            threads.clear_holder(lock);
        });
        debug!(thread = ?me, ?lock, "Lock::release");

        self.semaphore.up_in(&section);
    }

    /// Returns `true` if the current thread holds this lock.
    ///
    /// This can't be used to ask whether *some other* thread holds it, since
    /// the answer could change before the caller acts on it.
    #[must_use]
    pub fn held_by_current<S: Scheduler + ?Sized>(&self, sched: &S) -> bool {
        AtomicSection::scope(sched, |section| {
            let me = sched.current_thread();
            section.with_threads(|threads| threads.holder_of(self.id) == Some(me))
        })
    }

    /// Returns the thread holding this lock, if any.
    ///
    /// This is a snapshot, useful for diagnostics.
    #[must_use]
    pub fn holder<S: Scheduler + ?Sized>(&self, sched: &S) -> Option<ThreadId> {
        AtomicSection::scope(sched, |section| {
            section.with_threads(|threads| threads.holder_of(self.id))
        })
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("id", &self.id)
            .field("semaphore", &self.semaphore)
            .finish()
    }
}

/// Records `me` as the holder of `lock`. Every other thread still waiting
/// on `lock` becomes a donor to `me`.
fn take_ownership(threads: &mut Threads, me: ThreadId, lock: LockId, donates: bool) {
    threads.set_holder(lock, me);
    let adopted = donation::adopt_waiters(threads, me, lock);
    if adopted > 0 && donates {
        let priority = donation::update_donation(threads, me);
        trace!(thread = ?me, ?lock, adopted, %priority, "Lock -> adopted waiters");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::assert_send_sync;

    #[test]
    fn lock_is_send_and_sync() {
        assert_send_sync::<Lock>();
    }

    #[test]
    fn ids_are_unique() {
        let a = Lock::new();
        let b = Lock::default();
        assert_ne!(a.id(), b.id());
        assert!(a.id().as_u64() > 0);
    }
}
