//! A hosted uniprocessor scheduler for exercising `hyphae` outside a kernel.
//!
//! Each simulated kernel thread runs on its own OS thread, but only one of
//! them is ever running: the others are parked until the simulated scheduler
//! hands them the CPU. The scheduler always runs the highest-priority ready
//! thread, choosing among threads of equal priority in the order they became
//! ready, and switches threads only when the running thread blocks, yields,
//! exits, or is preempted by a higher-priority thread becoming ready.
//!
//! # Examples
//!
//! ```
//! use hyphae::{Lock, Priority};
//! use std::sync::Arc;
//!
//! hyphae_sim::run(|k| {
//!     let lock = Arc::new(Lock::new());
//!     lock.acquire(k);
//!
//!     let waiter = {
//!         let lock = lock.clone();
//!         k.spawn("waiter", Priority::new(40), move |k| {
//!             lock.acquire(k);
//!             lock.release(k);
//!         })
//!         .unwrap()
//!     };
//!
//!     // The waiter blocked on our lock, and donated its priority to us.
//!     assert_eq!(k.priority_of(k.current()), Priority::new(40));
//!
//!     lock.release(k);
//!     waiter.join(k);
//! });
//! ```
#![warn(missing_docs, missing_debug_implementations)]

mod kernel;

pub use self::kernel::{Error, JoinHandle, Kernel};

use hyphae::{Priority, SchedulingMode};
use std::panic;

/// Configures a simulated uniprocessor.
///
/// This is the equivalent of [`run`] with non-default settings.
#[derive(Clone, Debug)]
pub struct Builder {
    mode: SchedulingMode,
    capacity: usize,
    main_priority: Priority,
}

/// The default maximum number of live simulated threads.
pub const DEFAULT_CAPACITY: usize = 64;

/// Runs `f` as the `main` thread of a fresh simulated uniprocessor, with the
/// default [`Builder`] settings.
///
/// # Panics
///
/// If `f` panics, if any simulated thread panics, or if every simulated
/// thread becomes blocked.
#[track_caller]
pub fn run<R>(f: impl FnOnce(&Kernel) -> R) -> R {
    Builder::new().run(f)
}

/// Installs a `tracing` subscriber for the current test.
///
/// The filter is read from `RUST_LOG`, defaulting to debug-level output from
/// `hyphae` and `hyphae-sim`. Simulated threads inherit the subscriber of the
/// thread that spawned them.
#[must_use]
pub fn trace_init() -> impl Drop {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        util::SubscriberInitExt,
    };

    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse_lossy("hyphae=debug,hyphae_sim=debug")
    } else {
        builder.parse_lossy(env)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .without_time()
        .with_thread_names(true)
        .finish()
        .set_default()
}

// === impl Builder ===

impl Builder {
    /// Returns a new `Builder` with the default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: SchedulingMode::PriorityDonation,
            capacity: DEFAULT_CAPACITY,
            main_priority: Priority::DEFAULT,
        }
    }

    /// Sets the scheduling mode reported to the synchronization primitives.
    #[must_use]
    pub const fn mode(self, mode: SchedulingMode) -> Self {
        Self { mode, ..self }
    }

    /// Sets the maximum number of live simulated threads, including `main`.
    #[must_use]
    pub const fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Sets the priority the `main` thread starts with.
    #[must_use]
    pub const fn main_priority(self, main_priority: Priority) -> Self {
        Self {
            main_priority,
            ..self
        }
    }

    /// Runs `f` as the `main` thread of a fresh simulated uniprocessor.
    ///
    /// When `f` returns, any simulated threads that have not exited are shut
    /// down.
    ///
    /// # Panics
    ///
    /// If `f` panics, if any simulated thread panics, or if every simulated
    /// thread becomes blocked.
    #[track_caller]
    pub fn run<R>(&self, f: impl FnOnce(&Kernel) -> R) -> R {
        let kernel = Kernel::boot(self.mode, self.capacity, self.main_priority);
        tracing::debug!(mode = %self.mode, capacity = self.capacity, "simulation started");

        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| f(&kernel)));
        let failure = kernel.shut_down();
        tracing::debug!(ok = result.is_ok(), "simulation finished");

        match (result, failure) {
            (Err(payload), _) => panic::resume_unwind(payload),
            (Ok(_), Some(failure)) => panic!("{failure}"),
            (Ok(value), None) => value,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
