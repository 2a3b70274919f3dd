//! A counting semaphore whose waiters are woken in priority order.
//!
//! See the [`Semaphore`] type's documentation for details.
use crate::{
    donation,
    sched::{assert_can_block, Scheduler},
    section::{AtomicSection, SectionCell},
    thread::ThreadId,
};
use alloc::vec::Vec;
use core::fmt;

/// A counting semaphore.
///
/// A semaphore holds a nonnegative count and a list of blocked threads.
/// [`down`](Self::down) waits until the count is positive and then
/// decrements it; [`up`](Self::up) increments it and wakes one waiter.
///
/// # Wake order
///
/// Waiters are kept ordered by *effective* priority, highest first, and
/// threads with equal priority are woken in the order they started waiting.
/// Since a waiter's priority can be raised by donation while it is queued,
/// the list is re-sorted each time a waiter is woken, so the woken thread is
/// always the highest-priority waiter as of the wake.
///
/// A woken thread is not handed the count directly: it competes for it
/// again when it next runs. If another thread took the count in the
/// meantime, the woken thread goes back to waiting. This matches the usual
/// semantics of a kernel semaphore built on a "sleep until the condition
/// may have changed" primitive.
///
/// # Interrupt context
///
/// [`try_down`](Self::try_down) and [`up`](Self::up) never block, and may
/// be called from interrupt handlers. [`down`](Self::down) panics if called
/// from interrupt context.
pub struct Semaphore {
    state: SectionCell<State>,
}

struct State {
    count: usize,
    /// Blocked threads, ordered by effective priority as of insertion.
    waiters: Vec<ThreadId>,
}

impl Semaphore {
    /// Returns a new semaphore with the given initial count.
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            state: SectionCell::new(State {
                count,
                waiters: Vec::new(),
            }),
        }
    }

    /// Waits until the count is positive, then decrements it.
    ///
    /// # Panics
    ///
    /// If called from interrupt context.
    #[track_caller]
    pub fn down<S: Scheduler + ?Sized>(&self, sched: &S) {
        assert_can_block(sched, "Semaphore::down");
        let section = unsafe {
            // Safety: `section` lives until the end of this function, and
            // every section entered below it ends first.
            AtomicSection::enter(sched)
        };
        while !self.down_or_block(&section) {}
    }

    /// Decrements the count if it is positive, without waiting.
    ///
    /// Returns `true` if the count was decremented.
    pub fn try_down<S: Scheduler + ?Sized>(&self, sched: &S) -> bool {
        AtomicSection::scope(sched, |section| self.try_down_in(section))
    }

    /// Increments the count, and wakes the highest-priority waiter, if any.
    ///
    /// If the woken thread now outranks the caller, the scheduler is asked
    /// to preempt the caller (or, in interrupt context, to do so when the
    /// interrupt returns).
    pub fn up<S: Scheduler + ?Sized>(&self, sched: &S) {
        AtomicSection::scope(sched, |section| self.up_in(section));
    }

    /// Returns the current count.
    ///
    /// This is a snapshot, which may be stale by the time it is used.
    pub fn count<S: Scheduler + ?Sized>(&self, sched: &S) -> usize {
        AtomicSection::scope(sched, |section| self.state.with(section, |state| state.count))
    }

    /// Returns the number of threads waiting on the semaphore.
    pub fn waiter_count<S: Scheduler + ?Sized>(&self, sched: &S) -> usize {
        AtomicSection::scope(sched, |section| {
            self.state.with(section, |state| state.waiters.len())
        })
    }

    /// Takes one unit of the count if available; otherwise, enqueues the
    /// current thread and blocks it.
    ///
    /// Returns `true` if the count was taken. A `false` return means the
    /// thread was woken and must try again.
    pub(crate) fn down_or_block<S: Scheduler + ?Sized>(&self, section: &AtomicSection<'_, S>) -> bool {
        let sched = section.scheduler();
        let me = sched.current_thread();
        let acquired = self.state.with(section, |state| {
            if state.count > 0 {
                state.count -= 1;
                return true;
            }
            section.with_threads(|threads| {
                donation::insert_by_priority(threads, &mut state.waiters, me)
            });
            false
        });

        if !acquired {
            trace!(thread = ?me, "Semaphore::down -> blocking");
            sched.block(section);
            trace!(thread = ?me, "Semaphore::down -> woken");
        }
        acquired
    }

    pub(crate) fn try_down_in<S: Scheduler + ?Sized>(&self, section: &AtomicSection<'_, S>) -> bool {
        self.state.with(section, |state| {
            if state.count > 0 {
                state.count -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Like [`up`](Self::up), but inside an existing atomic section.
    pub(crate) fn up_in<S: Scheduler + ?Sized>(&self, section: &AtomicSection<'_, S>) {
        let sched = section.scheduler();
        let woken = self.state.with(section, |state| {
            state.count += 1;
            if state.waiters.is_empty() {
                return None;
            }
            // Priorities may have changed through donation since the
            // waiters were enqueued.
            section.with_threads(|threads| donation::sort_by_priority(threads, &mut state.waiters));
            Some(state.waiters.remove(0))
        });

        if let Some(thread) = woken {
            trace!(?thread, "Semaphore::up -> waking");
            sched.unblock(section, thread);
        }
        sched.request_preemption_check(section);
    }
}

impl Default for Semaphore {
    /// Returns a semaphore with a count of zero.
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("state", &self.state)
            .finish()
    }
}
