//! The contract between the synchronization primitives and the scheduler.
//!
//! Picking which thread runs next, switching contexts, and recomputing
//! priorities in feedback-queue mode are all the scheduler's job. The
//! primitives only need the handful of operations on [`Scheduler`].
use crate::{section::AtomicSection, thread::ThreadId, thread::ThreadTable};
use core::fmt;

/// How the scheduler assigns priorities.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum SchedulingMode {
    /// Priorities are set by threads themselves, and locks donate priority
    /// from blocked waiters to holders.
    #[default]
    PriorityDonation,
    /// Priorities are derived from CPU-usage accounting by a multilevel
    /// feedback queue. Locks perform no donation in this mode.
    FeedbackQueue,
}

/// The scheduler operations consumed by the synchronization primitives.
///
/// # Safety
///
/// Implementations must guarantee that:
///
/// - two atomic sections on the same scheduler never execute concurrently,
///   and leaving a section happens-before the next section is entered (on a
///   uniprocessor, disabling interrupts satisfies both);
/// - [`current_thread`] returns the same handle for the whole time a thread
///   is running, and that handle is live in [`threads`];
/// - [`block`] does not return until [`unblock`] has been called for the
///   calling thread and the thread has been scheduled again.
///
/// [`current_thread`]: Scheduler::current_thread
/// [`threads`]: Scheduler::threads
/// [`block`]: Scheduler::block
/// [`unblock`]: Scheduler::unblock
pub unsafe trait Scheduler {
    /// The preemption state saved by [`enter_atomic_section`] and restored
    /// by [`leave_atomic_section`] (for example, the previous interrupt
    /// level).
    ///
    /// [`enter_atomic_section`]: Scheduler::enter_atomic_section
    /// [`leave_atomic_section`]: Scheduler::leave_atomic_section
    type Level: Copy + fmt::Debug;

    /// Suspends preemption, returning the previous state.
    ///
    /// Prefer [`AtomicSection::scope`], which restores the state when it ends.
    fn enter_atomic_section(&self) -> Self::Level;

    /// Restores a preemption state saved by [`enter_atomic_section`].
    ///
    /// # Safety
    ///
    /// `saved` must be the value returned by the most recent unmatched call
    /// to `enter_atomic_section` on this thread.
    ///
    /// [`enter_atomic_section`]: Scheduler::enter_atomic_section
    unsafe fn leave_atomic_section(&self, saved: Self::Level);

    /// Returns the handle of the running thread.
    fn current_thread(&self) -> ThreadId;

    /// Returns the records of every thread this scheduler manages.
    fn threads(&self) -> &ThreadTable;

    /// Blocks the running thread until it is [unblocked](Scheduler::unblock)
    /// and rescheduled.
    ///
    /// This is called from inside an atomic section; other threads run (and
    /// enter their own sections) while the caller is blocked.
    fn block(&self, section: &AtomicSection<'_, Self>);

    /// Makes a blocked thread ready to run.
    ///
    /// This must not switch threads; callers follow up with
    /// [`request_preemption_check`](Scheduler::request_preemption_check) once
    /// their own state is consistent.
    fn unblock(&self, section: &AtomicSection<'_, Self>, thread: ThreadId);

    /// Asks the scheduler to switch away from the running thread if a
    /// higher-priority thread is now ready.
    ///
    /// In interrupt context, the switch should be deferred until the
    /// interrupt returns.
    fn request_preemption_check(&self, section: &AtomicSection<'_, Self>);

    /// Returns the active scheduling mode.
    fn mode(&self) -> SchedulingMode {
        SchedulingMode::PriorityDonation
    }

    /// Returns `true` if the caller is an interrupt handler, and therefore
    /// must not block.
    fn in_interrupt_context(&self) -> bool {
        false
    }
}

// === impl SchedulingMode ===

impl SchedulingMode {
    /// Returns `true` if locks should donate priority in this mode.
    #[inline]
    #[must_use]
    pub const fn donates(self) -> bool {
        matches!(self, Self::PriorityDonation)
    }
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::PriorityDonation => "priority donation",
            Self::FeedbackQueue => "multilevel feedback queue",
        })
    }
}

/// Panics if the caller is in interrupt context.
#[track_caller]
pub(crate) fn assert_can_block<S: Scheduler + ?Sized>(sched: &S, operation: &str) {
    assert!(
        !sched.in_interrupt_context(),
        "{operation} may block, and must not be called from interrupt context"
    );
}
