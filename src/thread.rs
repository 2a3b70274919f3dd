//! Thread records and the arena that owns them.
//!
//! The synchronization primitives never hold references to threads. Instead,
//! every thread is a record in a [`ThreadTable`], addressed by a [`ThreadId`]
//! handle. Semaphore wait lists, donor lists and lock ownership are all
//! collections of handles.
//!
//! A `ThreadId` carries the generation of the slot it was issued for, so a
//! handle that outlives its thread is detected (and is fatal) rather than
//! silently aliasing whatever thread reuses the slot.
use crate::{
    lock::LockId,
    sched::Scheduler,
    section::{AtomicSection, SectionCell},
};
use alloc::{collections::BTreeMap, string::String, vec::Vec};
use core::{fmt, ops};

/// A thread's scheduling priority.
///
/// Higher values are more urgent. Priorities range from [`Priority::MIN`] to
/// [`Priority::MAX`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Priority(u8);

/// A handle to a thread record in a [`ThreadTable`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId {
    index: u32,
    generation: u32,
}

/// The per-thread state read and written by the synchronization primitives.
#[derive(Debug)]
pub struct ThreadRecord {
    name: String,
    pub(crate) priority: Priority,
    pub(crate) base_priority: Priority,
    pub(crate) waiting_on: Option<LockId>,
    /// Threads that have donated priority to this thread, highest priority
    /// first. Never contains duplicates.
    pub(crate) donors: Vec<ThreadId>,
}

/// The contents of a [`ThreadTable`], accessible inside an atomic section.
#[derive(Debug)]
pub struct Threads {
    slots: Vec<Slot>,
    free: Vec<u32>,
    holders: BTreeMap<LockId, ThreadId>,
    capacity: usize,
    live: usize,
}

/// An arena of [`ThreadRecord`]s, shared between a scheduler and the
/// synchronization primitives.
#[derive(Debug)]
pub struct ThreadTable {
    threads: SectionCell<Threads>,
}

/// Errors returned by [`Threads::spawn`].
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum SpawnError {
    /// Every slot in the table is occupied by a live thread.
    #[error("thread table exhausted: all {capacity} slots are in use")]
    Exhausted {
        /// The table's capacity.
        capacity: usize,
    },
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<ThreadRecord>,
}

// === impl Priority ===

impl Priority {
    /// The lowest priority.
    pub const MIN: Self = Self(0);
    /// The priority threads are created with unless told otherwise.
    pub const DEFAULT: Self = Self(31);
    /// The highest priority.
    pub const MAX: Self = Self(63);

    /// Returns a new `Priority`.
    ///
    /// # Panics
    ///
    /// If `priority` is greater than [`Priority::MAX`].
    #[must_use]
    pub const fn new(priority: u8) -> Self {
        assert!(
            priority <= Self::MAX.0,
            "a priority may not be greater than Priority::MAX"
        );
        Self(priority)
    }

    /// Returns the numeric value of this priority.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// === impl ThreadId ===

impl ThreadId {
    /// Returns the index of the slot this handle refers to.
    ///
    /// Indices are reused once a thread is removed; two handles with the same
    /// index are only equal if they were issued for the same thread.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

// === impl ThreadRecord ===

impl ThreadRecord {
    /// Returns the thread's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the thread's effective priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the thread's priority absent any donation.
    #[must_use]
    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    /// Returns the lock this thread is blocked acquiring, if any.
    #[must_use]
    pub fn waiting_on(&self) -> Option<LockId> {
        self.waiting_on
    }

    /// Returns the threads currently donating priority to this thread.
    #[must_use]
    pub fn donors(&self) -> &[ThreadId] {
        &self.donors
    }
}

// === impl Threads ===

impl Threads {
    /// Returns an empty table with room for `capacity` live threads.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity <= u32::MAX as usize,
            "a thread table may not hold more than u32::MAX threads"
        );
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            holders: BTreeMap::new(),
            capacity,
            live: 0,
        }
    }

    /// Creates a record for a new thread with the given name and base
    /// priority.
    pub fn spawn(
        &mut self,
        name: impl Into<String>,
        priority: Priority,
    ) -> Result<ThreadId, SpawnError> {
        if self.live >= self.capacity {
            return Err(SpawnError::Exhausted {
                capacity: self.capacity,
            });
        }

        let record = ThreadRecord {
            name: name.into(),
            priority,
            base_priority: priority,
            waiting_on: None,
            donors: Vec::new(),
        };

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.record.is_none(), "free slot {index} is occupied");
                slot.record = Some(record);
                ThreadId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                ThreadId {
                    index,
                    generation: 0,
                }
            }
        };
        self.live += 1;
        trace!(thread = ?id, %priority, "Threads::spawn");
        Ok(id)
    }

    /// Removes a thread's record, invalidating its handle.
    ///
    /// # Panics
    ///
    /// If `id` is not a live thread, or if the thread still holds a lock or
    /// is waiting to acquire one.
    #[track_caller]
    pub fn remove(&mut self, id: ThreadId) -> ThreadRecord {
        let held = self.held_by(id).next();
        assert!(
            held.is_none(),
            "thread {id:?} ({}) exited while holding {:?}",
            self[id].name,
            held
        );
        assert!(
            self[id].waiting_on.is_none(),
            "thread {id:?} ({}) exited while waiting on {:?}",
            self[id].name,
            self[id].waiting_on
        );

        let taken = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.take().map(|record| (slot, record)));
        let Some((slot, record)) = taken else {
            panic!("invalid thread handle {id:?}: no such live thread");
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        trace!(thread = ?id, "Threads::remove");
        record
    }

    /// Returns `true` if `id` refers to a live thread.
    #[must_use]
    pub fn contains(&self, id: ThreadId) -> bool {
        self.get(id).is_some()
    }

    /// Returns the record for `id`, or `None` if the handle is stale.
    #[must_use]
    pub fn get(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadRecord> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// Returns the effective priority of `id`.
    #[track_caller]
    #[must_use]
    pub fn priority(&self, id: ThreadId) -> Priority {
        self[id].priority
    }

    /// Returns the base priority of `id`.
    #[track_caller]
    #[must_use]
    pub fn base_priority(&self, id: ThreadId) -> Priority {
        self[id].base_priority
    }

    /// Overwrites the effective priority of `id`, bypassing donation.
    ///
    /// This is intended for schedulers that compute priorities themselves
    /// (see [`SchedulingMode::FeedbackQueue`]).
    ///
    /// [`SchedulingMode::FeedbackQueue`]: crate::sched::SchedulingMode::FeedbackQueue
    #[track_caller]
    pub fn set_effective_priority(&mut self, id: ThreadId, priority: Priority) {
        self[id].priority = priority;
    }

    /// Returns the lock `id` is blocked acquiring, if any.
    #[track_caller]
    #[must_use]
    pub fn waiting_on(&self, id: ThreadId) -> Option<LockId> {
        self[id].waiting_on
    }

    /// Returns the threads donating to `id`, highest priority first as of
    /// the last time the list was ordered.
    #[track_caller]
    #[must_use]
    pub fn donors(&self, id: ThreadId) -> &[ThreadId] {
        &self[id].donors
    }

    /// Returns the thread holding `lock`, if it is held.
    #[must_use]
    pub fn holder_of(&self, lock: LockId) -> Option<ThreadId> {
        self.holders.get(&lock).copied()
    }

    /// Returns the locks held by `thread`.
    pub fn held_by(&self, thread: ThreadId) -> impl Iterator<Item = LockId> + '_ {
        self.holders
            .iter()
            .filter(move |&(_, &holder)| holder == thread)
            .map(|(&lock, _)| lock)
    }

    /// Returns the number of live threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if there are no live threads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns the maximum number of live threads.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over every live thread.
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, &ThreadRecord)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let record = slot.record.as_ref()?;
            let id = ThreadId {
                index: index as u32,
                generation: slot.generation,
            };
            Some((id, record))
        })
    }

    pub(crate) fn set_holder(&mut self, lock: LockId, holder: ThreadId) {
        let prev = self.holders.insert(lock, holder);
        debug_assert!(
            prev.is_none(),
            "{lock:?} handed to {holder:?} while still held by {prev:?}"
        );
    }

    pub(crate) fn clear_holder(&mut self, lock: LockId) -> Option<ThreadId> {
        self.holders.remove(&lock)
    }

    pub(crate) fn set_waiting_on(&mut self, id: ThreadId, lock: Option<LockId>) {
        self[id].waiting_on = lock;
    }
}

impl ops::Index<ThreadId> for Threads {
    type Output = ThreadRecord;

    #[track_caller]
    fn index(&self, id: ThreadId) -> &Self::Output {
        match self.get(id) {
            Some(record) => record,
            None => panic!("invalid thread handle {id:?}: no such live thread"),
        }
    }
}

impl ops::IndexMut<ThreadId> for Threads {
    #[track_caller]
    fn index_mut(&mut self, id: ThreadId) -> &mut Self::Output {
        match self.get_mut(id) {
            Some(record) => record,
            None => panic!("invalid thread handle {id:?}: no such live thread"),
        }
    }
}

// === impl ThreadTable ===

impl ThreadTable {
    /// Returns an empty table with room for `capacity` live threads.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::from(Threads::new(capacity))
    }

    /// Runs `f` with exclusive access to the thread records.
    #[track_caller]
    pub fn with<S, U>(&self, section: &AtomicSection<'_, S>, f: impl FnOnce(&mut Threads) -> U) -> U
    where
        S: Scheduler + ?Sized,
    {
        self.threads.with(section, f)
    }
}

impl From<Threads> for ThreadTable {
    /// Returns a table shared between a scheduler and the primitives, with
    /// records the scheduler has already created (such as its boot thread).
    fn from(threads: Threads) -> Self {
        Self {
            threads: SectionCell::new(threads),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_remove() {
        let mut threads = Threads::new(4);
        let a = threads.spawn("a", Priority::new(3)).unwrap();
        let b = threads.spawn("b", Priority::DEFAULT).unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[a].name(), "a");
        assert_eq!(threads.priority(a), Priority::new(3));
        assert_eq!(threads.base_priority(b), Priority::DEFAULT);

        let record = threads.remove(a);
        assert_eq!(record.name(), "a");
        assert!(!threads.contains(a));
        assert!(threads.contains(b));
        assert_eq!(threads.len(), 1);
    }

    #[test]
    fn reused_slot_invalidates_stale_handle() {
        let mut threads = Threads::new(1);
        let a = threads.spawn("a", Priority::DEFAULT).unwrap();
        threads.remove(a);
        let b = threads.spawn("b", Priority::DEFAULT).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(threads.get(a).is_none());
        assert_eq!(threads[b].name(), "b");
    }

    #[test]
    #[should_panic(expected = "invalid thread handle")]
    fn stale_handle_is_fatal() {
        let mut threads = Threads::new(2);
        let a = threads.spawn("a", Priority::DEFAULT).unwrap();
        threads.remove(a);
        let _ = threads.priority(a);
    }

    #[test]
    #[should_panic(expected = "invalid thread handle")]
    fn removing_twice_is_fatal() {
        let mut threads = Threads::new(2);
        let a = threads.spawn("a", Priority::DEFAULT).unwrap();
        threads.remove(a);
        threads.remove(a);
    }

    #[test]
    fn exhaustion() {
        let mut threads = Threads::new(2);
        threads.spawn("a", Priority::DEFAULT).unwrap();
        threads.spawn("b", Priority::DEFAULT).unwrap();
        let err = threads.spawn("c", Priority::DEFAULT).unwrap_err();
        assert_eq!(err, SpawnError::Exhausted { capacity: 2 });
        assert_eq!(
            err.to_string(),
            "thread table exhausted: all 2 slots are in use"
        );
    }

    #[test]
    fn holders() {
        let mut threads = Threads::new(2);
        let a = threads.spawn("a", Priority::DEFAULT).unwrap();
        let l1 = LockId::next();
        let l2 = LockId::next();
        threads.set_holder(l1, a);
        threads.set_holder(l2, a);
        assert_eq!(threads.holder_of(l1), Some(a));
        assert_eq!(threads.held_by(a).collect::<Vec<_>>(), vec![l1, l2]);
        assert_eq!(threads.clear_holder(l1), Some(a));
        assert_eq!(threads.holder_of(l1), None);
        assert_eq!(threads.held_by(a).collect::<Vec<_>>(), vec![l2]);
    }

    #[test]
    #[should_panic(expected = "exited while holding")]
    fn remove_while_holding_is_fatal() {
        let mut threads = Threads::new(1);
        let a = threads.spawn("a", Priority::DEFAULT).unwrap();
        threads.set_holder(LockId::next(), a);
        threads.remove(a);
    }

    #[test]
    #[should_panic(expected = "may not be greater than Priority::MAX")]
    fn priority_out_of_range() {
        let _ = Priority::new(64);
    }
}
