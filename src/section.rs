//! Atomic sections and the state cells they guard.
//!
//! Every piece of shared synchronization state in this crate (semaphore
//! counts and wait lists, lock ownership, donor lists, thread priorities) is
//! mutated only while an [`AtomicSection`] is held. The primitives cannot be
//! guarded by higher-level locks, since they *are* the locks, so the sole
//! mutation discipline is: suspend preemption, mutate, restore the previous
//! preemption state.
//!
//! State is stored in [`SectionCell`]s. A cell can only be accessed by
//! presenting a reference to the current [`AtomicSection`], and accessing a
//! cell that is already being accessed panics rather than handing out an
//! aliasing `&mut`.
use crate::sched::Scheduler;
use crate::thread::Threads;
use core::{any, cell::UnsafeCell, fmt};
use portable_atomic::{
    AtomicBool,
    Ordering::{Acquire, Relaxed, Release},
};

/// A RAII guard for a region in which preemption is suspended.
///
/// Creating an `AtomicSection` calls [`Scheduler::enter_atomic_section`];
/// dropping it restores the saved state with
/// [`Scheduler::leave_atomic_section`]. Because restoration happens in `Drop`,
/// it also happens on early returns and while unwinding from a fatal error.
///
/// Sections nest: entering a section while one is already held saves the
/// "already suspended" state, and leaving the inner section restores it.
/// This only works if nested sections end in the reverse of the order they
/// were entered, so the guard can be created safely only through
/// [`AtomicSection::scope`]. [`AtomicSection::enter`] is `unsafe`, and its
/// callers are responsible for that ordering.
#[must_use = "an `AtomicSection` ends as soon as it is dropped"]
pub struct AtomicSection<'a, S: Scheduler + ?Sized> {
    sched: &'a S,
    saved: S::Level,
}

/// Interior-mutable storage for state that is only touched inside an
/// [`AtomicSection`].
///
/// This is essentially a spinlock that never spins: the only way two
/// accesses can overlap is a bug (reentrant access from inside
/// [`SectionCell::with`], or two schedulers sharing one primitive), so an
/// overlapping access panics instead of waiting.
pub struct SectionCell<T> {
    borrowed: AtomicBool,
    data: UnsafeCell<T>,
}

struct Borrow<'a> {
    borrowed: &'a AtomicBool,
}

// === impl AtomicSection ===

impl<'a, S: Scheduler + ?Sized> AtomicSection<'a, S> {
    /// Runs `f` inside a new atomic section on `sched`.
    ///
    /// The section ends when `f` returns or unwinds.
    #[inline]
    pub fn scope<U>(sched: &'a S, f: impl FnOnce(&Self) -> U) -> U {
        let section = unsafe {
            // Safety: `f` only borrows the section, so it can neither drop nor
            // leak it, and every section entered inside `f` has ended by the
            // time `section` is dropped here.
            Self::enter(sched)
        };
        f(&section)
    }

    /// Suspends preemption on `sched`, returning a guard that restores the
    /// previous state when dropped.
    ///
    /// # Safety
    ///
    /// Sections entered on the same thread must be dropped in the reverse of
    /// the order they were entered in, and the guard must not be leaked. A
    /// section dropped while a section entered after it is still held
    /// restores a stale preemption state, and the outermost section then
    /// leaves preemption suspended.
    ///
    /// A guard bound to a local at the top of a function, and never moved
    /// out of it, satisfies this.
    pub unsafe fn enter(sched: &'a S) -> Self {
        let saved = sched.enter_atomic_section();
        Self { sched, saved }
    }

    /// Returns the scheduler this section was entered on.
    #[inline]
    #[must_use]
    pub fn scheduler(&self) -> &'a S {
        self.sched
    }

    /// Runs `f` with exclusive access to the scheduler's thread records.
    #[inline]
    #[track_caller]
    pub fn with_threads<U>(&self, f: impl FnOnce(&mut Threads) -> U) -> U {
        self.sched.threads().with(self, f)
    }
}

impl<S: Scheduler + ?Sized> Drop for AtomicSection<'_, S> {
    fn drop(&mut self) {
        unsafe {
            // Safety: `saved` is the value returned by the matching call to
            // `enter_atomic_section`, and the contract of `enter` ensures that
            // every section entered after this one has already ended.
            self.sched.leave_atomic_section(self.saved);
        }
    }
}

impl<S: Scheduler + ?Sized> fmt::Debug for AtomicSection<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicSection")
            .field("saved", &self.saved)
            .finish_non_exhaustive()
    }
}

// === impl SectionCell ===

impl<T> SectionCell<T> {
    /// Returns a new `SectionCell` containing `data`.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Runs `f` with exclusive access to the cell's contents.
    ///
    /// The `section` argument is proof that the caller is inside an atomic
    /// section; it is not otherwise used.
    ///
    /// # Panics
    ///
    /// If the cell is already being accessed. This indicates either a
    /// reentrant call from inside `f`, or a primitive shared between two
    /// schedulers.
    #[track_caller]
    pub fn with<S, U>(&self, section: &AtomicSection<'_, S>, f: impl FnOnce(&mut T) -> U) -> U
    where
        S: Scheduler + ?Sized,
    {
        let _ = section;
        let _borrow = self.borrow();
        f(unsafe {
            // Safety: the `borrowed` flag guarantees that no other reference
            // to the data exists until `_borrow` is dropped.
            &mut *self.data.get()
        })
    }

    /// Returns a mutable reference to the contents.
    ///
    /// This requires no atomic section, since the `&mut self` receiver
    /// statically guarantees exclusive access.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the cell, returning its contents.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    #[track_caller]
    fn borrow(&self) -> Borrow<'_> {
        if test_dbg!(self
            .borrowed
            .compare_exchange(false, true, Acquire, Relaxed)
            .is_err())
        {
            panic!(
                "SectionCell<{}> accessed while it was already being accessed; \
                 synchronization state must not be touched reentrantly",
                any::type_name::<T>()
            );
        }
        Borrow {
            borrowed: &self.borrowed,
        }
    }
}

unsafe impl<T: Send> Send for SectionCell<T> {}
unsafe impl<T: Send> Sync for SectionCell<T> {}

impl<T: Default> Default for SectionCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SectionCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionCell")
            .field("borrowed", &self.borrowed.load(Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for Borrow<'_> {
    fn drop(&mut self) {
        test_dbg!(self.borrowed.store(false, Release));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        thread::{Priority, ThreadId, ThreadTable, Threads},
        util::test::assert_send_sync,
    };
    use core::cell::{Cell, RefCell};
    use std::panic;

    /// Counts how deeply nested the current section is, and records every
    /// restore.
    struct Nesting {
        depth: Cell<usize>,
        restores: RefCell<Vec<String>>,
        threads: ThreadTable,
        main: ThreadId,
    }

    impl Nesting {
        fn new() -> Self {
            let mut threads = Threads::new(1);
            let main = threads.spawn("main", Priority::DEFAULT).unwrap();
            Self {
                depth: Cell::new(0),
                restores: RefCell::new(Vec::new()),
                threads: ThreadTable::from(threads),
                main,
            }
        }
    }

    unsafe impl Scheduler for Nesting {
        type Level = usize;

        fn enter_atomic_section(&self) -> usize {
            self.depth.replace(self.depth.get() + 1)
        }

        unsafe fn leave_atomic_section(&self, saved: usize) {
            self.restores
                .borrow_mut()
                .push(format!("{} -> {saved}", self.depth.get()));
            self.depth.set(saved);
        }

        fn current_thread(&self) -> ThreadId {
            self.main
        }

        fn threads(&self) -> &ThreadTable {
            &self.threads
        }

        fn block(&self, _: &AtomicSection<'_, Self>) {
            unreachable!("nothing blocks in these tests")
        }

        fn unblock(&self, _: &AtomicSection<'_, Self>, _: ThreadId) {
            unreachable!("nothing blocks in these tests")
        }

        fn request_preemption_check(&self, _: &AtomicSection<'_, Self>) {}
    }

    #[test]
    fn nested_scopes_restore_in_reverse_order() {
        let sched = Nesting::new();
        AtomicSection::scope(&sched, |_| {
            assert_eq!(sched.depth.get(), 1);
            AtomicSection::scope(&sched, |inner| {
                assert_eq!(sched.depth.get(), 2);
                assert_eq!(inner.with_threads(|threads| threads.len()), 1);
            });
            assert_eq!(sched.depth.get(), 1);
        });
        assert_eq!(sched.depth.get(), 0);
        assert_eq!(*sched.restores.borrow(), ["2 -> 1", "1 -> 0"]);
    }

    #[test]
    fn nested_guards_restore_in_reverse_order() {
        let sched = Nesting::new();
        {
            let _outer = unsafe { AtomicSection::enter(&sched) };
            let _inner = unsafe { AtomicSection::enter(&sched) };
            assert_eq!(sched.depth.get(), 2);
        }
        assert_eq!(sched.depth.get(), 0);
        assert_eq!(*sched.restores.borrow(), ["2 -> 1", "1 -> 0"]);
    }

    #[test]
    fn scope_is_restored_on_unwind() {
        let sched = Nesting::new();
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            AtomicSection::scope(&sched, |_| {
                AtomicSection::scope(&sched, |_| panic!("fatal error in a section"))
            })
        }));
        assert!(result.is_err());
        assert_eq!(sched.depth.get(), 0);
        assert_eq!(*sched.restores.borrow(), ["2 -> 1", "1 -> 0"]);
    }

    #[test]
    fn section_cell_is_send_and_sync() {
        assert_send_sync::<SectionCell<usize>>();
    }

    #[test]
    fn borrow_flag_is_released() {
        let cell = SectionCell::new(1usize);
        {
            let _b = cell.borrow();
            assert!(cell.borrowed.load(Relaxed));
        }
        assert!(!cell.borrowed.load(Relaxed));
        let _b = cell.borrow();
    }

    #[test]
    #[should_panic(expected = "accessed while it was already being accessed")]
    fn overlapping_borrow_panics() {
        let cell = SectionCell::new(1usize);
        let _a = cell.borrow();
        let _b = cell.borrow();
    }

    #[test]
    fn get_mut_bypasses_flag() {
        let mut cell = SectionCell::new(1usize);
        *cell.get_mut() += 1;
        assert_eq!(cell.into_inner(), 2);
    }
}
