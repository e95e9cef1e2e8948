//! Worker-pool collaborator: fixed threads, broadcast dispatch, fork/join.
//!
//! The pool owns `degree - 1` OS threads. A dispatch publishes one
//! type-erased closure, then stamps a fresh generation word carrying the
//! participant count; each worker whose id is below the count runs the
//! closure with its own id and decrements the join counter. The dispatching
//! thread runs its own share and spins on the join counter, so the closure
//! may borrow stack-local state: dispatch never outlives the caller's
//! frame.
//!
//! Workers idle in one of two modes. While spinning (low-latency pools and
//! open parallel sections) they yield-poll the generation counter; otherwise
//! they park on a condvar and are woken per dispatch.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;

use crate::error::PoolError;
use crate::options::PoolOptions;
use crate::profiler::Profiler;

type Trampoline = unsafe fn(*const (), usize);

// Monomorphized entry point recovering the concrete closure type.
unsafe fn invoke<F: Fn(usize) + Sync>(context: *const (), idx: usize) {
    let f = unsafe { &*(context as *const F) };
    f(idx);
}

unsafe fn dangling_trampoline(_context: *const (), _idx: usize) {
    unreachable!("dispatch slot read before first publish");
}

/// The generation word carries the participant count in its low bits, so a
/// single acquire load tells a worker both that a new dispatch exists and
/// whether it takes part. Keeping the count in a separate location would
/// let a worker that observed an old generation read the count of the next
/// one mid-publish.
const ITEMS_BITS: u32 = 16;
const ITEMS_MASK: usize = (1 << ITEMS_BITS) - 1;

/// State shared between the dispatching thread and all workers.
///
/// The dispatch slot fields are plain cells: they are written only by the
/// thread holding the dispatch lock, strictly before the release store of
/// `generation`, and read only by workers whose id is below the participant
/// count of the generation they observed, strictly after the acquire load.
/// Non-participants never touch the cells.
struct Shared {
    num_threads: usize,
    context: UnsafeCell<*const ()>,
    trampoline: UnsafeCell<Trampoline>,
    generation: CachePadded<AtomicUsize>,
    pending: CachePadded<AtomicUsize>,
    spinning: AtomicBool,
    shutdown: AtomicBool,
    wake: Mutex<()>,
    wake_cv: Condvar,
    first_panic: Mutex<Option<Box<dyn Any + Send>>>,
    profiler: Profiler,
}

// SAFETY: the dispatch-slot cells follow the publish protocol described on
// the struct; everything else is atomics or lock-protected.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

thread_local! {
    // (pool identity, worker id) for the current thread, set once at worker
    // startup. Threads outside any pool keep the default.
    static CURRENT_WORKER: Cell<(usize, i32)> = const { Cell::new((0, -1)) };

    // Pool whose dispatch lock the current thread holds, if any. Lets a
    // loop body that calls back into the pool detect that the lock further
    // up its own stack is not reacquirable.
    static DISPATCHING_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Holds the dispatch lock and marks the owning thread for re-entrancy
/// detection. The previous marker is restored on drop so dispatches nested
/// across different pools unwind correctly.
pub(crate) struct DispatchGuard<'pool> {
    previous: usize,
    _lock: std::sync::MutexGuard<'pool, ()>,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        DISPATCHING_POOL.set(self.previous);
    }
}

fn worker_loop(shared: &Shared, id: usize) {
    CURRENT_WORKER.set((shared as *const Shared as usize, id as i32));

    // Generations start at zero; loading the current value here instead
    // could silently swallow a dispatch issued while this thread was still
    // starting up.
    let mut last_generation = 0;
    loop {
        // Wait for the next dispatch or for shutdown.
        let generation = loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            let generation = shared.generation.load(Ordering::Acquire);
            if generation != last_generation {
                break generation;
            }
            if shared.spinning.load(Ordering::Relaxed) {
                thread::yield_now();
            } else {
                let guard = shared.wake.lock().unwrap();
                // Re-check under the lock so a wakeup between the load and
                // the wait cannot be lost. The spinning flag is included:
                // dispatches in spin mode do not notify, so parking with
                // the flag set would sleep through them.
                if shared.generation.load(Ordering::Acquire) == last_generation
                    && !shared.shutdown.load(Ordering::Acquire)
                    && !shared.spinning.load(Ordering::Relaxed)
                {
                    drop(shared.wake_cv.wait(guard).unwrap());
                }
            }
        };
        last_generation = generation;

        if id >= (generation & ITEMS_MASK) {
            continue;
        }
        // SAFETY: the acquire load of `generation` above synchronizes with
        // the release store in `dispatch`, making the slot writes visible,
        // and participants finish before the next publish begins.
        let context = unsafe { *shared.context.get() };
        let trampoline = unsafe { *shared.trampoline.get() };

        shared.profiler.log_run(id);
        // SAFETY: the dispatching thread keeps the closure alive until the
        // join counter reaches zero, which happens only after this call.
        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe { trampoline(context, id) }));
        if let Err(payload) = result {
            let mut slot = shared.first_panic.lock().unwrap();
            if slot.is_none() {
                *slot = Some(payload);
            }
        }
        shared.pending.fetch_sub(1, Ordering::Release);
    }
}

/// Book-keeping for one open parallel section.
pub(crate) struct SectionState {
    prev_spinning: bool,
}

/// A fixed set of worker threads driven by generation-stamped broadcasts.
pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    dispatch_lock: Mutex<()>,
}

impl WorkerPool {
    /// Spawns `degree_of_parallelism - 1` workers. The options must have
    /// been validated.
    pub(crate) fn spawn(options: &PoolOptions) -> Result<Self, PoolError> {
        let num_threads = options.degree_of_parallelism - 1;
        let name = options.name.clone().unwrap_or_else(|| "parloop".to_string());

        let shared = Arc::new(Shared {
            num_threads,
            context: UnsafeCell::new(std::ptr::null()),
            trampoline: UnsafeCell::new(dangling_trampoline),
            generation: CachePadded::new(AtomicUsize::new(0)),
            pending: CachePadded::new(AtomicUsize::new(0)),
            spinning: AtomicBool::new(options.low_latency_hint),
            shutdown: AtomicBool::new(false),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
            first_panic: Mutex::new(None),
            profiler: Profiler::new(name.clone(), num_threads),
        });

        let mut handles = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            // The first affinity entry belongs to the caller thread.
            let core_id = options
                .affinity
                .as_ref()
                .and_then(|cores| cores.get(id + 1))
                .copied();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || {
                    if let Some(core_id) = core_id {
                        core_affinity::set_for_current(core_id);
                    }
                    worker_loop(&shared, id);
                })?;
            handles.push(handle);
        }

        Ok(WorkerPool {
            shared,
            handles,
            dispatch_lock: Mutex::new(()),
        })
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.shared.num_threads
    }

    pub(crate) fn profiler(&self) -> &Profiler {
        &self.shared.profiler
    }

    fn token(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Worker id of the calling thread within this pool, `-1` for threads
    /// outside it.
    pub(crate) fn current_thread_id(&self) -> i32 {
        let (pool, id) = CURRENT_WORKER.get();
        if pool == self.token() {
            id
        } else {
            -1
        }
    }

    /// Whether the calling thread already holds this pool's dispatch lock
    /// further up its stack.
    pub(crate) fn is_dispatching_here(&self) -> bool {
        DISPATCHING_POOL.get() == self.token()
    }

    pub(crate) fn set_spinning(&self, spinning: bool) {
        self.shared.spinning.store(spinning, Ordering::Relaxed);
        if spinning {
            // Lift parked workers into the spin loop.
            let _guard = self.shared.wake.lock().unwrap();
            self.shared.wake_cv.notify_all();
        }
    }

    /// Serializes dispatches from concurrent caller threads. Held across
    /// dispatch and join; pool workers never take it, and the guard marks
    /// the owning thread so re-entrant calls can detect it.
    pub(crate) fn lock_dispatch(&self) -> DispatchGuard<'_> {
        let lock = self.dispatch_lock.lock().unwrap();
        let previous = DISPATCHING_POOL.replace(self.token());
        DispatchGuard {
            previous,
            _lock: lock,
        }
    }

    /// Publishes `f` to the first `worker_items` workers. The caller must
    /// hold the dispatch lock, keep `f` alive until [`wait_all`] returns,
    /// and call [`wait_all`] before the next dispatch.
    pub(crate) fn dispatch<F: Fn(usize) + Sync>(&self, f: &F, worker_items: usize) {
        debug_assert!(worker_items <= self.shared.num_threads);
        debug_assert!(worker_items <= ITEMS_MASK);
        // SAFETY: the dispatch lock makes this thread the only writer, and
        // the previous join drained every reader.
        unsafe {
            *self.shared.context.get() = f as *const F as *const ();
            *self.shared.trampoline.get() = invoke::<F>;
        }
        self.shared.pending.store(worker_items, Ordering::Relaxed);
        let current = self.shared.generation.load(Ordering::Relaxed);
        let next = (((current >> ITEMS_BITS) + 1) << ITEMS_BITS) | worker_items;
        self.shared.generation.store(next, Ordering::Release);
        if !self.shared.spinning.load(Ordering::Relaxed) {
            let _guard = self.shared.wake.lock().unwrap();
            self.shared.wake_cv.notify_all();
        }
    }

    /// Spins until every dispatched work item has returned. The acquire
    /// load pairs with the workers' release decrements, ordering their
    /// writes before the caller's continuation.
    pub(crate) fn wait_all(&self) {
        while self.shared.pending.load(Ordering::Acquire) != 0 {
            thread::yield_now();
        }
    }

    /// First panic payload captured from a work item since the last call.
    pub(crate) fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        self.shared.first_panic.lock().unwrap().take()
    }

    pub(crate) fn allocate_section(&self) -> Box<SectionState> {
        Box::new(SectionState {
            prev_spinning: false,
        })
    }

    /// Transitions workers into a ready-to-run mode for the duration of a
    /// section, so back-to-back loops skip the park/unpark cycle.
    pub(crate) fn start_section(&self, section: &mut SectionState) {
        section.prev_spinning = self.shared.spinning.load(Ordering::Relaxed);
        self.set_spinning(true);
    }

    pub(crate) fn end_section(&self, section: &mut SectionState) {
        self.set_spinning(section.prev_spinning);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.wake.lock().unwrap();
            self.shared.wake_cv.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
