//! Priority donation.
//!
//! When a thread blocks acquiring a [`Lock`] held by a lower-priority thread,
//! it *donates* its priority to the holder, so that the holder is not starved
//! by middle-priority threads while the high-priority thread waits on it
//! (priority inversion). Two situations make this more than a single
//! assignment:
//!
//! - **Nested donation**: if the holder is itself blocked on another lock,
//!   the donation must follow the chain of `waiting_on` links. [`donate`]
//!   walks the chain to its end, with no fixed bound on its length.
//! - **Multiple donation**: a thread may hold several locks, each with its
//!   own waiters. Releasing one lock must only withdraw the donations made
//!   through that lock. [`remove_donors_for`] and [`update_donation`]
//!   recompute the holder's priority from the donors that remain.
//!
//! The functions in this module operate on [`Threads`] and are called by
//! [`Lock`] from inside an atomic section. They are public so that
//! schedulers can apply the same rules when a thread changes its own
//! priority (see [`set_base_priority`]).
//!
//! [`Lock`]: crate::Lock
use crate::{
    lock::LockId,
    sched::SchedulingMode,
    thread::{Priority, ThreadId, Threads},
};
use alloc::vec::Vec;
use core::{cmp::Reverse, mem};

/// Sorts `list` by effective priority, highest first.
///
/// The sort is stable, so threads of equal priority keep their relative
/// order (FIFO among equals).
pub fn sort_by_priority(threads: &Threads, list: &mut [ThreadId]) {
    list.sort_by_key(|&thread| Reverse(threads.priority(thread)));
}

/// Inserts `thread` into `list` after every thread whose effective priority
/// is greater than or equal to its own.
pub fn insert_by_priority(threads: &Threads, list: &mut Vec<ThreadId>, thread: ThreadId) {
    let priority = threads.priority(thread);
    let at = list
        .iter()
        .position(|&queued| threads.priority(queued) < priority)
        .unwrap_or(list.len());
    list.insert(at, thread);
}

/// Records `donor` as donating to `holder`.
///
/// Any existing entry for `donor` is removed first, so a donation is never
/// counted twice.
pub fn add_donor(threads: &mut Threads, holder: ThreadId, donor: ThreadId) {
    let mut donors = mem::take(&mut threads[holder].donors);
    donors.retain(|&existing| existing != donor);
    insert_by_priority(threads, &mut donors, donor);
    threads[holder].donors = donors;
}

/// Removes every donor of `holder` that is waiting on `lock`, returning how
/// many were removed.
pub fn remove_donors_for(threads: &mut Threads, holder: ThreadId, lock: LockId) -> usize {
    let mut donors = mem::take(&mut threads[holder].donors);
    let before = donors.len();
    donors.retain(|&donor| threads.waiting_on(donor) != Some(lock));
    let removed = before - donors.len();
    threads[holder].donors = donors;
    removed
}

/// Records every thread still waiting on `lock` as a donor to `holder`,
/// which has just acquired it, returning how many were recorded.
///
/// When a lock changes hands, the previous holder withdraws the donations
/// made through it, so the remaining waiters must donate to the new holder
/// instead.
pub fn adopt_waiters(threads: &mut Threads, holder: ThreadId, lock: LockId) -> usize {
    let waiters: Vec<ThreadId> = threads
        .iter()
        .filter(|&(id, record)| id != holder && record.waiting_on() == Some(lock))
        .map(|(id, _)| id)
        .collect();
    for &waiter in &waiters {
        add_donor(threads, holder, waiter);
    }
    waiters.len()
}

/// Propagates the priority of `donor` along the chain of locks it is
/// waiting on.
///
/// Starting at `donor`, each hop follows the lock the current thread is
/// waiting on to that lock's holder. If the holder's priority is lower than
/// the current thread's, it is raised to match. The walk ends at a thread
/// that is not waiting on a lock, or at a lock that currently has no holder
/// (it was just released, and its next owner has not run yet).
///
/// Returns the number of hops taken.
///
/// # Panics
///
/// If the chain leads back to `donor`: a thread waiting, directly or
/// transitively, on a lock it holds is deadlocked, which is a contract
/// violation.
#[track_caller]
pub fn donate(threads: &mut Threads, donor: ThreadId) -> usize {
    // A chain that does not revisit a thread has at most `len - 1` hops.
    let bound = threads.len();
    let mut walker = donor;
    let mut hops = 0;

    while let Some(lock) = threads.waiting_on(walker) {
        let Some(holder) = threads.holder_of(lock) else {
            trace!(thread = ?walker, ?lock, hops, "donate -> lock has no holder");
            break;
        };

        assert_ne!(
            holder, donor,
            "priority donation cycle: {donor:?} is waiting on {lock:?}, which it holds"
        );

        if hops >= bound {
            error!(
                ?donor,
                thread = ?walker,
                ?lock,
                hops,
                "donate -> wait chain revisits a thread; stopping"
            );
            break;
        }

        let priority = threads.priority(walker);
        if threads.priority(holder) < priority {
            debug!(
                from = ?walker,
                to = ?holder,
                ?lock,
                %priority,
                "donating priority"
            );
            threads[holder].priority = priority;
        }

        walker = holder;
        hops += 1;
    }

    hops
}

/// Recomputes the effective priority of `thread` from its base priority and
/// its remaining donors, returning the new priority.
///
/// The thread's priority becomes the greater of its base priority and the
/// highest priority among its donors.
pub fn update_donation(threads: &mut Threads, thread: ThreadId) -> Priority {
    let mut donors = mem::take(&mut threads[thread].donors);
    sort_by_priority(threads, &mut donors);

    let base = threads.base_priority(thread);
    let priority = match donors.first() {
        Some(&top) => threads.priority(top).max(base),
        None => base,
    };

    let record = &mut threads[thread];
    record.donors = donors;
    if record.priority != priority {
        debug!(?thread, from = %record.priority, to = %priority, "restoring priority");
    }
    record.priority = priority;
    priority
}

/// Sets the base priority of `thread`, returning its new effective priority.
///
/// In [`SchedulingMode::PriorityDonation`], a thread that is receiving
/// donations keeps the highest donated priority until those donations end,
/// and a thread that is itself waiting on a lock passes a raised priority
/// along its wait chain. In [`SchedulingMode::FeedbackQueue`], both the base
/// and effective priorities are simply overwritten.
pub fn set_base_priority(
    threads: &mut Threads,
    thread: ThreadId,
    priority: Priority,
    mode: SchedulingMode,
) -> Priority {
    threads[thread].base_priority = priority;
    if !mode.donates() {
        threads[thread].priority = priority;
        return priority;
    }

    let effective = update_donation(threads, thread);
    if threads.waiting_on(thread).is_some() {
        donate(threads, thread);
    }
    effective
}
