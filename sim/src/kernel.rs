use hyphae::{
    donation, thread::SpawnError, AtomicSection, Priority, Scheduler, SchedulingMode, Semaphore,
    ThreadId, ThreadTable, Threads,
};
use std::{
    any::Any,
    cell::Cell,
    collections::VecDeque,
    fmt::{self, Write},
    panic,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
};
use tracing::{debug, error, trace, Dispatch};

/// A simulated uniprocessor kernel.
///
/// `Kernel` implements [`Scheduler`], so a `&Kernel` is passed to every
/// `hyphae` operation. Each simulated thread receives a reference to the
/// same kernel.
pub struct Kernel {
    shared: Arc<Shared>,
}

/// A handle for waiting on a simulated thread to exit.
#[derive(Debug)]
#[must_use = "dropping a `JoinHandle` detaches the thread"]
pub struct JoinHandle {
    id: ThreadId,
    name: String,
    exited: Arc<Semaphore>,
}

/// Errors returned by [`Kernel::spawn`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The simulated thread table is full.
    #[error(transparent)]
    Table(#[from] SpawnError),
    /// The OS thread backing a simulated thread could not be created.
    #[error("failed to spawn an OS thread for a simulated thread")]
    Os(#[from] std::io::Error),
}

struct Shared {
    threads: ThreadTable,
    mode: SchedulingMode,
    main: ThreadId,
    queue: Mutex<RunQueue>,
    switched: Condvar,
    os_threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

#[derive(Debug)]
struct RunQueue {
    running: Option<ThreadId>,
    ready: VecDeque<ThreadId>,
    failure: Option<String>,
    shutdown: bool,
}

/// Unwinds a parked thread out of the simulation once it has ended.
struct Shutdown;

/// Whether a switching thread stays ready to run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Switch {
    Yield,
    Block,
    Exit,
}

/// Restores the interrupt-context flag when a simulated handler returns or
/// unwinds.
struct InterruptGuard;

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
    static SECTION: Cell<bool> = const { Cell::new(false) };
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
    static YIELD_ON_RETURN: Cell<bool> = const { Cell::new(false) };
}

// === impl Kernel ===

impl Kernel {
    pub(crate) fn boot(mode: SchedulingMode, capacity: usize, main_priority: Priority) -> Self {
        assert!(
            CURRENT.get().is_none(),
            "a simulation may not be started from inside another simulation"
        );

        let mut threads = Threads::new(capacity);
        let main = match threads.spawn("main", main_priority) {
            Ok(main) => main,
            Err(error) => panic!("cannot start a simulation: {error}"),
        };
        let shared = Arc::new(Shared {
            threads: ThreadTable::from(threads),
            mode,
            main,
            queue: Mutex::new(RunQueue {
                running: Some(main),
                ready: VecDeque::new(),
                failure: None,
                shutdown: false,
            }),
            switched: Condvar::new(),
            os_threads: Mutex::new(Vec::new()),
        });

        CURRENT.set(Some(main));
        SECTION.set(false);
        IN_INTERRUPT.set(false);
        YIELD_ON_RETURN.set(false);
        Self { shared }
    }

    /// Creates a new simulated thread running `f`, with the given name and
    /// priority.
    ///
    /// If the new thread has a higher priority than the caller, it runs
    /// immediately.
    pub fn spawn<F>(
        &self,
        name: impl Into<String>,
        priority: Priority,
        f: F,
    ) -> Result<JoinHandle, Error>
    where
        F: FnOnce(&Kernel) + Send + 'static,
    {
        let name = name.into();
        let section = unsafe {
            // Safety: `section` lives until the end of this function, and
            // every section entered below it ends first.
            AtomicSection::enter(self)
        };
        let id = section.with_threads(|threads| threads.spawn(name.clone(), priority))?;
        let exited = Arc::new(Semaphore::new(0));

        let kernel = Kernel {
            shared: self.shared.clone(),
        };
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
        let thread_name = name.clone();
        let thread_exited = exited.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    kernel.thread_main(id, &thread_name, &thread_exited, f)
                })
            });
        let os_thread = match spawned {
            Ok(os_thread) => os_thread,
            Err(error) => {
                section.with_threads(|threads| threads.remove(id));
                return Err(error.into());
            }
        };
        self.shared.lock_os_threads().push(os_thread);
        debug!(thread = ?id, %name, %priority, "spawned");

        self.unblock(&section, id);
        self.request_preemption_check(&section);
        Ok(JoinHandle { id, name, exited })
    }

    /// Returns the handle of the running thread.
    #[must_use]
    pub fn current(&self) -> ThreadId {
        self.current_thread()
    }

    /// Returns the effective priority of `thread`.
    #[must_use]
    pub fn priority_of(&self, thread: ThreadId) -> Priority {
        AtomicSection::scope(self, |section| {
            section.with_threads(|threads| threads.priority(thread))
        })
    }

    /// Returns the base priority of `thread`.
    #[must_use]
    pub fn base_priority_of(&self, thread: ThreadId) -> Priority {
        AtomicSection::scope(self, |section| {
            section.with_threads(|threads| threads.base_priority(thread))
        })
    }

    /// Sets the running thread's base priority, then yields if a ready
    /// thread now outranks it.
    pub fn set_priority(&self, priority: Priority) {
        let section = unsafe {
            // Safety: `section` lives until the end of this function, and
            // every section entered below it ends first.
            AtomicSection::enter(self)
        };
        let me = self.current_thread();
        let mode = self.shared.mode;
        let effective =
            section.with_threads(|threads| donation::set_base_priority(threads, me, priority, mode));
        debug!(thread = ?me, base = %priority, %effective, "set priority");
        self.request_preemption_check(&section);
    }

    /// Moves the running thread to the back of the ready queue, and runs the
    /// highest-priority ready thread.
    pub fn yield_now(&self) {
        AtomicSection::scope(self, |section| self.switch(section, Switch::Yield));
    }

    /// Runs `f` as an interrupt handler on the running thread.
    ///
    /// While `f` runs, [`Scheduler::in_interrupt_context`] returns `true`, so
    /// blocking operations panic. Preemption requested by `f` is deferred
    /// until it returns.
    pub fn interrupt<R>(&self, f: impl FnOnce(&Kernel) -> R) -> R {
        assert!(!IN_INTERRUPT.get(), "simulated interrupts may not nest");
        let result = {
            let _guard = InterruptGuard::enter();
            AtomicSection::scope(self, |_| f(self))
        };

        if YIELD_ON_RETURN.replace(false) {
            trace!(thread = ?self.current_thread(), "yielding on interrupt return");
            self.yield_now();
        }
        result
    }

    /// Returns the number of live simulated threads, including `main`.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        AtomicSection::scope(self, |section| section.with_threads(|threads| threads.len()))
    }

    /// Returns the active scheduling mode.
    #[must_use]
    pub fn scheduling_mode(&self) -> SchedulingMode {
        self.shared.mode
    }

    /// Ends the simulation, unwinding every parked thread and waiting for
    /// their OS threads to exit. Returns the failure that ended the
    /// simulation, if there was one.
    pub(crate) fn shut_down(&self) -> Option<String> {
        let mut failure = {
            let mut queue = self.shared.lock_queue();
            queue.shutdown = true;
            self.shared.switched.notify_all();
            queue.failure.clone()
        };

        loop {
            let os_threads = std::mem::take(&mut *self.shared.lock_os_threads());
            if os_threads.is_empty() {
                break;
            }
            for os_thread in os_threads {
                if let Some(escaped) = join_os_thread(os_thread) {
                    failure.get_or_insert(escaped);
                }
            }
        }

        CURRENT.set(None);
        failure
    }

    fn thread_main<F>(&self, id: ThreadId, name: &str, exited: &Semaphore, f: F)
    where
        F: FnOnce(&Kernel),
    {
        CURRENT.set(Some(id));
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            self.wait_for_turn(self.shared.lock_queue(), id);
            trace!(thread = ?id, "started");
            f(self);
            self.exit(id, exited);
        }));

        if let Err(payload) = result {
            if payload.is::<Shutdown>() {
                trace!(thread = ?id, "shut down");
                return;
            }
            self.fail(format!(
                "simulated thread '{name}' ({id:?}) panicked: {}",
                panic_message(&*payload)
            ));
        }
    }

    fn exit(&self, id: ThreadId, exited: &Semaphore) {
        let section = unsafe {
            // Safety: `section` lives until the end of this function, and
            // every section entered below it ends first.
            AtomicSection::enter(self)
        };
        // Waking a joiner may preempt us; that's fine, we'll come back here.
        exited.up(self);
        let record = section.with_threads(|threads| threads.remove(id));
        debug!(thread = ?id, name = record.name(), "exited");
        self.switch(&section, Switch::Exit);
    }

    /// Records a failure that ends the simulation, and wakes every parked
    /// thread so that `main` can report it.
    fn fail(&self, failure: String) {
        error!(%failure, "simulation failed");
        let mut queue = self.shared.lock_queue();
        queue.failure.get_or_insert(failure);
        queue.running = None;
        self.shared.switched.notify_all();
    }

    /// Hands the CPU to the highest-priority ready thread.
    fn switch(&self, section: &AtomicSection<'_, Self>, how: Switch) {
        let me = self.current_thread();
        let mut queue = self.shared.lock_queue();
        debug_assert_eq!(queue.running, Some(me), "only the running thread may switch");
        if how == Switch::Yield {
            queue.ready.push_back(me);
        }

        let next = section.with_threads(|threads| pick_next(&mut queue.ready, threads));
        let Some(next) = next else {
            let failure = section.with_threads(deadlock_report);
            error!(%failure, "simulation deadlocked");
            queue.failure.get_or_insert(failure);
            queue.running = None;
            self.shared.switched.notify_all();
            if how != Switch::Exit {
                // Diverges: `main` reports the failure, everyone else unwinds.
                self.wait_for_turn(queue, me);
            }
            return;
        };

        if next != me {
            trace!(from = ?me, to = ?next, ?how, "switch");
        }
        queue.running = Some(next);
        self.shared.switched.notify_all();
        if how != Switch::Exit {
            self.wait_for_turn(queue, me);
        }
    }

    /// Parks the calling OS thread until its simulated thread is chosen to
    /// run.
    ///
    /// If the simulation ends first, `main` panics with the reason and every
    /// other thread unwinds with [`Shutdown`].
    fn wait_for_turn(&self, mut queue: MutexGuard<'_, RunQueue>, me: ThreadId) {
        loop {
            let failure = queue.failure.clone();
            if queue.shutdown || failure.is_some() {
                drop(queue);
                match failure {
                    Some(failure) if me == self.shared.main => panic!("{failure}"),
                    _ => panic::resume_unwind(Box::new(Shutdown)),
                }
            }
            if queue.running == Some(me) {
                return;
            }
            queue = self
                .shared
                .switched
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

unsafe impl Scheduler for Kernel {
    type Level = bool;

    fn enter_atomic_section(&self) -> bool {
        SECTION.replace(true)
    }

    unsafe fn leave_atomic_section(&self, saved: bool) {
        SECTION.set(saved);
    }

    #[track_caller]
    fn current_thread(&self) -> ThreadId {
        match CURRENT.get() {
            Some(id) => id,
            None => panic!("this OS thread is not running a simulated thread"),
        }
    }

    fn threads(&self) -> &ThreadTable {
        &self.shared.threads
    }

    fn block(&self, section: &AtomicSection<'_, Self>) {
        trace!(thread = ?self.current_thread(), "block");
        self.switch(section, Switch::Block);
    }

    fn unblock(&self, _: &AtomicSection<'_, Self>, thread: ThreadId) {
        let mut queue = self.shared.lock_queue();
        debug_assert!(
            !queue.ready.contains(&thread),
            "{thread:?} unblocked while already ready"
        );
        trace!(?thread, "unblock");
        queue.ready.push_back(thread);
    }

    fn request_preemption_check(&self, section: &AtomicSection<'_, Self>) {
        let me = self.current_thread();
        let preempt = {
            let queue = self.shared.lock_queue();
            section.with_threads(|threads| {
                let priority = threads.priority(me);
                queue
                    .ready
                    .iter()
                    .any(|&ready| threads.priority(ready) > priority)
            })
        };
        if !preempt {
            return;
        }

        if IN_INTERRUPT.get() {
            YIELD_ON_RETURN.set(true);
        } else {
            trace!(thread = ?me, "preempted");
            self.switch(section, Switch::Yield);
        }
    }

    fn mode(&self) -> SchedulingMode {
        self.shared.mode
    }

    fn in_interrupt_context(&self) -> bool {
        IN_INTERRUPT.get()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("mode", &self.shared.mode)
            .field("main", &self.shared.main)
            .field("queue", &self.shared.queue)
            .finish_non_exhaustive()
    }
}

// === impl JoinHandle ===

impl JoinHandle {
    /// Waits for the thread to exit.
    pub fn join(self, kernel: &Kernel) {
        trace!(thread = ?self.id, name = %self.name, "join");
        self.exited.down(kernel);
    }

    /// Returns the handle of the thread.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the thread's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// === impl Shared ===

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, RunQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_os_threads(&self) -> MutexGuard<'_, Vec<thread::JoinHandle<()>>> {
        self.os_threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// === impl InterruptGuard ===

impl InterruptGuard {
    fn enter() -> Self {
        IN_INTERRUPT.set(true);
        Self
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        IN_INTERRUPT.set(false);
    }
}

/// Removes and returns the highest-priority thread in `ready`, taking the
/// earliest among equals.
fn pick_next(ready: &mut VecDeque<ThreadId>, threads: &Threads) -> Option<ThreadId> {
    let mut best: Option<(usize, Priority)> = None;
    for (i, &thread) in ready.iter().enumerate() {
        let priority = threads.priority(thread);
        if best.map_or(true, |(_, best)| priority > best) {
            best = Some((i, priority));
        }
    }
    let (i, _) = best?;
    ready.remove(i)
}

fn deadlock_report(threads: &mut Threads) -> String {
    let mut report = String::from("deadlock: every simulated thread is blocked");
    for (id, record) in threads.iter() {
        let _ = write!(
            report,
            "\n  {id:?} '{}' priority={} base={}",
            record.name(),
            record.priority(),
            record.base_priority()
        );
        if let Some(lock) = record.waiting_on() {
            let _ = write!(report, " waiting_on={lock:?}");
        }
    }
    report
}

/// Waits for an OS thread to exit, returning a failure if a panic escaped
/// the simulated thread it ran.
fn join_os_thread(os_thread: thread::JoinHandle<()>) -> Option<String> {
    let name = os_thread.thread().name().unwrap_or("<unnamed>").to_owned();
    let payload = os_thread.join().err()?;
    let failure = format!(
        "OS thread '{name}' panicked outside of its simulated thread: {}",
        panic_message(&*payload)
    );
    error!(%failure, "simulation failed during shutdown");
    Some(failure)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
