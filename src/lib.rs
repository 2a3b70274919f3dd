#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

extern crate alloc;

#[macro_use]
mod util;

pub mod condvar;
pub mod donation;
pub mod lock;
pub mod sched;
pub mod section;
pub mod semaphore;
pub mod thread;

#[doc(inline)]
pub use self::condvar::Condvar;
#[doc(inline)]
pub use self::lock::{Lock, LockId};
#[doc(inline)]
pub use self::sched::{Scheduler, SchedulingMode};
#[doc(inline)]
pub use self::section::{AtomicSection, SectionCell};
#[doc(inline)]
pub use self::semaphore::Semaphore;
#[doc(inline)]
pub use self::thread::{Priority, SpawnError, ThreadId, ThreadRecord, ThreadTable, Threads};
