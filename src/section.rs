//! Parallel sections: keeping workers hot across a series of loops.
//!
//! A parallel section is a scoped resource. While one is open, the pool's
//! workers stay in a spinning ready-to-run state instead of re-parking
//! between loops, which matters for operators that issue many short loops
//! back to back. Sections must not nest: dispatch inside a section assumes
//! there is exactly one active section state per thread.

use std::cell::Cell;

use crate::pool::ThreadPool;
use crate::worker::SectionState;

thread_local! {
    // Whether the current thread has an open section. Deliberately not
    // keyed by pool: one section per thread, full stop.
    static IN_SECTION: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn in_section() -> bool {
    IN_SECTION.with(|s| s.get())
}

/// Scoped handle for a parallel section. Dropping it releases the section
/// on every exit path, including unwinding.
///
/// # Panics
///
/// Opening a second section on a thread that already holds one is a
/// programming error and panics.
///
/// # Example
///
/// ```no_run
/// use parloop::{ParallelSection, PoolOptions, ThreadPool};
///
/// let pool = ThreadPool::new(PoolOptions::new().with_degree_of_parallelism(4)).unwrap();
/// let section = ParallelSection::new(&pool);
/// pool.simple_parallel_for(1024, |_i| {});
/// pool.simple_parallel_for(1024, |_i| {});
/// drop(section);
/// ```
pub struct ParallelSection<'pool> {
    pool: &'pool ThreadPool,
    state: Option<Box<SectionState>>,
}

impl<'pool> ParallelSection<'pool> {
    pub fn new(pool: &'pool ThreadPool) -> Self {
        assert!(
            !in_section(),
            "nested parallel sections are not supported"
        );
        // A pool without workers has nothing to keep warm; the handle is
        // inert and the thread-local marker stays clear.
        let state = pool.workers().map(|workers| {
            let mut state = workers.allocate_section();
            workers.start_section(&mut state);
            IN_SECTION.with(|s| s.set(true));
            state
        });
        ParallelSection { pool, state }
    }
}

impl Drop for ParallelSection<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            if let Some(workers) = self.pool.workers() {
                let profiler = workers.profiler();
                profiler.log_start();
                workers.end_section(&mut state);
                profiler.log_end(crate::profiler::Event::WaitRevoke);
            }
            IN_SECTION.with(|s| s.set(false));
        }
    }
}

/// Runs `f` inside a parallel section, releasing it on all exit paths.
pub fn with_parallel_section<R>(pool: &ThreadPool, f: impl FnOnce(&ParallelSection<'_>) -> R) -> R {
    let section = ParallelSection::new(pool);
    f(&section)
}
