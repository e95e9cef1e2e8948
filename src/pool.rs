//! High-level parallel-for interface.
//!
//! The `ThreadPool` is the primary entry point for running parallel loops.
//! It owns the worker pool, picks block sizes through the cost model, and
//! drives the sharded loop counter until every iteration has run exactly
//! once. Loops that are too small to benefit from parallelism run inline
//! on the caller.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::cost::{self, OpCost};
use crate::counter::LoopCounter;
use crate::error::PoolError;
use crate::options::PoolOptions;
use crate::profiler::Event;
use crate::section;
use crate::worker::WorkerPool;

/// Number of extra block-count strands per thread on hybrid CPUs. Blocks,
/// not threads, are oversubscribed, smoothing over heterogeneous core
/// speeds.
const TASK_GRANULARITY_FACTOR: usize = 4;

/// A pool of worker threads plus the scheduling logic that divides loops
/// between them and the caller.
///
/// # Example
///
/// ```no_run
/// use parloop::{PoolOptions, ThreadPool};
///
/// let pool = ThreadPool::new(PoolOptions::new().with_degree_of_parallelism(4)).unwrap();
/// let mut sums = vec![0u64; 1 << 20];
/// // Borrowed state is fine: dispatch joins before returning.
/// pool.parallel_for_fixed_block_size(sums.len(), 1024, |first, last| {
///     for i in first..last {
///         // touch sums[i] through interior mutability or disjoint slices
///         let _ = i;
///     }
/// });
/// ```
pub struct ThreadPool {
    workers: Option<WorkerPool>,
    force_hybrid: bool,
    dynamic_block_base: i64,
}

impl ThreadPool {
    /// Creates a pool with `degree_of_parallelism - 1` workers; the caller
    /// thread supplies the remaining strand. A degree of 1 creates no
    /// workers and every loop runs inline.
    pub fn new(options: PoolOptions) -> Result<Self, PoolError> {
        options.validate()?;
        let workers = if options.degree_of_parallelism >= 2 {
            Some(WorkerPool::spawn(&options)?)
        } else {
            None
        };
        Ok(ThreadPool {
            workers,
            force_hybrid: options.force_hybrid,
            dynamic_block_base: options.dynamic_block_base,
        })
    }

    /// Number of worker threads, excluding the caller.
    pub fn num_threads(&self) -> usize {
        self.workers.as_ref().map_or(0, |w| w.num_threads())
    }

    /// Worker id of the calling thread, or `-1` for threads outside the
    /// pool.
    pub fn current_thread_id(&self) -> i32 {
        self.workers.as_ref().map_or(-1, |w| w.current_thread_id())
    }

    /// Whether a loop of `num_iterations` in blocks of `block_size` is
    /// worth dispatching at all.
    pub fn should_parallelize_loop(&self, num_iterations: usize, block_size: usize) -> bool {
        // A single block of work is not worth distributing.
        if block_size == 0 || num_iterations <= block_size {
            return false;
        }
        // From outside the pool we need at least one worker; from inside
        // the pool we need at least one worker beyond ourselves.
        let id = self.current_thread_id();
        if (id == -1 && self.num_threads() == 0) || (id != -1 && self.num_threads() == 1) {
            return false;
        }
        true
    }

    /// Runs `fn(first, last)` over `[0, n)` with a block size chosen from
    /// the per-iteration cost.
    ///
    /// The ranges delivered to `f` are pairwise disjoint and cover the
    /// iteration space exactly; no ordering between them is guaranteed, and
    /// `f` may run on the caller or on any worker.
    pub fn parallel_for<F>(&self, n: usize, cost: &OpCost, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        if n == 0 {
            return;
        }
        let d_of_p = degree_of_parallelism(Some(self));
        // Compute small problems directly on the caller thread.
        if !self.should_parallelize_loop(n, 1) || cost.ideal_num_threads(n, d_of_p) == 1 {
            f(0, n);
            return;
        }
        let block = cost::calculate_block(n, cost, None, d_of_p);
        self.parallel_for_fixed_block_size(n, block, f);
    }

    /// Like [`parallel_for`](Self::parallel_for) for compute-bound bodies:
    /// the cost is `cycles_per_iteration` compute cycles and no memory
    /// traffic.
    pub fn parallel_for_with_unit_cost<F>(&self, n: usize, cycles_per_iteration: f64, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        self.parallel_for(n, &OpCost::with_compute_cycles(cycles_per_iteration), f);
    }

    /// Runs `fn(first, last)` over `[0, n)` with a caller-chosen block
    /// size, skipping the cost model.
    pub fn parallel_for_fixed_block_size<F>(&self, n: usize, block_size: usize, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        assert!(block_size >= 1, "block size must be at least 1");
        if n == 0 {
            return;
        }
        if n <= block_size {
            f(0, n);
            return;
        }

        let d_of_p = degree_of_parallelism(Some(self));
        if self.dynamic_block_base <= 0 {
            // Static policy: one claim loop per strand, at most one strand
            // per block.
            let num_blocks = n / block_size;
            let num_work_items = (self.num_threads() + 1).min(num_blocks);
            let counter = LoopCounter::new(n, d_of_p, block_size);
            let run_work = |idx: usize| {
                let home_shard = counter.home_shard(idx as u32);
                let mut shard = home_shard;
                while let Some(range) = counter.claim_iterations(home_shard, &mut shard, block_size)
                {
                    f(range.start, range.end);
                }
            };
            self.run_in_parallel(&run_work, num_work_items, block_size);
        } else {
            // Dynamic policy: aim for a fixed number of blocks overall and
            // shrink each strand's block as the remaining work drains, so
            // the tail of the loop is cut into ever finer pieces.
            let target_blocks = d_of_p * self.dynamic_block_base as usize;
            let base_block_size = ((n as f64 / target_blocks as f64).round() as usize).max(1);
            let left = CachePadded::new(AtomicIsize::new(n as isize));
            let counter = LoopCounter::new(n, d_of_p, base_block_size);
            let run_work = |idx: usize| {
                let mut block = base_block_size;
                let home_shard = counter.home_shard(idx as u32);
                let mut shard = home_shard;
                while let Some(range) = counter.claim_iterations(home_shard, &mut shard, block) {
                    f(range.start, range.end);
                    // The counter is advisory: claims stay correct whatever
                    // value we read here.
                    let todo = left.fetch_sub(range.len() as isize, Ordering::Relaxed);
                    if block > 1 {
                        let next = ((todo as f64 / target_blocks as f64).round() as usize).max(1);
                        if next < block {
                            block = next;
                            self.log_dynamic_block_size(block);
                        }
                    }
                }
            };
            let num_work_items = (self.num_threads() + 1).min(target_blocks);
            self.run_in_parallel(&run_work, num_work_items, base_block_size);
            // Every claim has been subtracted from `left` once the join
            // releases, so this records the size the schedule converged to.
            let final_block =
                ((left.load(Ordering::Relaxed) as f64 / target_blocks as f64).round() as usize)
                    .max(1);
            self.log_dynamic_block_size(final_block);
        }
    }

    /// Runs `fn(i)` once for every `i` in `[0, n)`, one index at a time.
    pub fn simple_parallel_for<F>(&self, n: usize, f: F)
    where
        F: Fn(usize) + Sync,
    {
        self.parallel_for_fixed_block_size(n, 1, |first, last| {
            for i in first..last {
                f(i);
            }
        });
    }

    /// Runs `f` once on a pool worker and returns after it completes.
    /// Without workers the closure runs inline.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send,
    {
        let Some(workers) = &self.workers else {
            f();
            return;
        };
        // Calling back into the pool from a work item, or from a loop body
        // on the thread driving the dispatch, must not touch the dispatch
        // lock: it is held until that outer dispatch joins, which in turn
        // waits on this strand. Run on the current strand instead.
        if workers.current_thread_id() != -1 || workers.is_dispatching_here() {
            f();
            return;
        }
        let slot = std::sync::Mutex::new(Some(f));
        let run_work = |_idx: usize| {
            if let Some(f) = slot.lock().unwrap().take() {
                f();
            }
        };
        let _guard = workers.lock_dispatch();
        workers.dispatch(&run_work, 1);
        workers.wait_all();
        if let Some(payload) = workers.take_panic() {
            panic::resume_unwind(payload);
        }
    }

    /// Asks workers to spin while idle instead of parking. A hint only.
    pub fn enable_spinning(&self) {
        if let Some(workers) = &self.workers {
            workers.set_spinning(true);
        }
    }

    /// Lets idle workers park again. A hint only.
    pub fn disable_spinning(&self) {
        if let Some(workers) = &self.workers {
            workers.set_spinning(false);
        }
    }

    /// Starts collecting profiling data for this pool.
    pub fn start_profiling(&self) {
        if let Some(workers) = &self.workers {
            workers.profiler().start();
        }
    }

    /// Stops collecting and returns the JSON report, or an empty string for
    /// a pool without workers.
    pub fn stop_profiling(&self) -> String {
        match &self.workers {
            Some(workers) => workers.profiler().stop(),
            None => String::new(),
        }
    }

    pub(crate) fn workers(&self) -> Option<&WorkerPool> {
        self.workers.as_ref()
    }

    // The block-size log belongs to the thread driving the loop; work items
    // running on pool workers skip it.
    fn log_dynamic_block_size(&self, block_size: usize) {
        if let Some(workers) = &self.workers {
            if workers.current_thread_id() == -1 {
                workers.profiler().log_block_size(block_size);
            }
        }
    }

    /// Dispatches `num_work_items` claim loops: up to `num_work_items - 1`
    /// on workers (work item `i` always lands on worker `i`, keeping the
    /// home-shard mapping stable across loops) and one on the caller, which
    /// participates with id `num_threads()`.
    fn run_in_parallel<F>(&self, f: &F, num_work_items: usize, block_size: usize)
    where
        F: Fn(usize) + Sync,
    {
        let Some(workers) = &self.workers else {
            f(0);
            return;
        };

        // Re-entrant dispatch would self-deadlock on the dispatch lock:
        // from a worker, against the caller that holds it while joining;
        // from a loop body on the dispatching thread itself, against the
        // lock further up this stack. Run the whole loop on this strand
        // instead.
        let caller_id = workers.current_thread_id();
        if caller_id != -1 {
            f(caller_id as usize);
            return;
        }
        if workers.is_dispatching_here() {
            f(workers.num_threads());
            return;
        }

        let profiler = workers.profiler();
        let worker_items = num_work_items.saturating_sub(1).min(workers.num_threads());
        if worker_items == 0 {
            f(workers.num_threads());
            return;
        }

        let _guard = workers.lock_dispatch();
        profiler.log_start_and_core_and_block(block_size);
        workers.dispatch(f, worker_items);
        profiler.log_end_and_start(if section::in_section() {
            Event::DistributionEnqueue
        } else {
            Event::Distribution
        });

        // The caller's own share must not unwind past the join: workers
        // still hold a borrow of `f`.
        let caller_result = panic::catch_unwind(AssertUnwindSafe(|| f(workers.num_threads())));
        profiler.log_end_and_start(Event::Run);
        workers.wait_all();
        profiler.log_end(Event::Wait);

        // The first failure wins; later ones are discarded.
        if let Some(payload) = workers.take_panic() {
            panic::resume_unwind(payload);
        }
        if let Err(payload) = caller_result {
            panic::resume_unwind(payload);
        }
    }
}

/// Effective worker count used for sizing decisions: workers plus the
/// caller, oversubscribed by [`TASK_GRANULARITY_FACTOR`] on hybrid CPUs,
/// and 1 for the inline pool.
pub fn degree_of_parallelism(pool: Option<&ThreadPool>) -> usize {
    match pool {
        Some(pool) if pool.force_hybrid => (pool.num_threads() + 1) * TASK_GRANULARITY_FACTOR,
        Some(pool) => pool.num_threads() + 1,
        None => 1,
    }
}

/// Whether dispatching through `pool` can use more than one strand.
pub fn should_parallelize(pool: Option<&ThreadPool>) -> bool {
    degree_of_parallelism(pool) != 1
}

/// [`ThreadPool::parallel_for`] through an optional pool: `None` runs the
/// whole loop inline on the caller.
pub fn try_parallel_for<F>(pool: Option<&ThreadPool>, n: usize, cost: &OpCost, f: F)
where
    F: Fn(usize, usize) + Sync,
{
    match pool {
        Some(pool) => pool.parallel_for(n, cost, f),
        None => {
            if n > 0 {
                f(0, n);
            }
        }
    }
}

/// [`ThreadPool::simple_parallel_for`] through an optional pool.
pub fn try_simple_parallel_for<F>(pool: Option<&ThreadPool>, n: usize, f: F)
where
    F: Fn(usize) + Sync,
{
    match pool {
        Some(pool) => pool.simple_parallel_for(n, f),
        None => {
            for i in 0..n {
                f(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(degree: usize) -> ThreadPool {
        ThreadPool::new(PoolOptions::new().with_degree_of_parallelism(degree)).unwrap()
    }

    #[test]
    fn test_zero_iterations_never_invokes() {
        let pool = pool(4);
        let calls = AtomicUsize::new(0);
        pool.parallel_for(0, &OpCost::with_compute_cycles(100.0), |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_short_loop_runs_inline_once() {
        let pool = pool(4);
        let calls = AtomicUsize::new(0);
        let outside = std::thread::current().id();
        pool.parallel_for_fixed_block_size(8, 16, |first, last| {
            assert_eq!((first, last), (0, 8));
            assert_eq!(std::thread::current().id(), outside);
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fixed_block_exact_cover() {
        let pool = pool(4);
        let n = 100_000;
        let hits: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
        pool.parallel_for_fixed_block_size(n, 64, |first, last| {
            for i in first..last {
                hits[i].fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_degree_reflects_hybrid_override() {
        let plain = pool(4);
        assert_eq!(degree_of_parallelism(Some(&plain)), 4);
        assert_eq!(degree_of_parallelism(None), 1);

        let hybrid = ThreadPool::new(
            PoolOptions::new()
                .with_degree_of_parallelism(4)
                .with_force_hybrid(true),
        )
        .unwrap();
        assert_eq!(degree_of_parallelism(Some(&hybrid)), 16);
    }

    #[test]
    fn test_should_parallelize_loop_edges() {
        let pool = pool(4);
        assert!(!pool.should_parallelize_loop(10, 10));
        assert!(!pool.should_parallelize_loop(10, 0));
        assert!(pool.should_parallelize_loop(11, 10));

        let inline = ThreadPool::new(PoolOptions::new().with_degree_of_parallelism(1)).unwrap();
        assert!(!inline.should_parallelize_loop(1000, 1));
    }

    #[test]
    fn test_schedule_runs_exactly_once() {
        let pool = pool(3);
        let calls = AtomicUsize::new(0);
        pool.schedule(|| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_from_inside_a_work_item_runs_inline() {
        let pool = pool(3);
        let calls = AtomicUsize::new(0);
        pool.schedule(|| {
            // Runs on a worker; the nested call must not touch the
            // dispatch machinery.
            pool.schedule(|| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_schedule_from_inside_a_loop_body_runs_inline() {
        let pool = pool(3);
        let calls = AtomicUsize::new(0);
        // The body runs on workers and on the dispatching caller; both
        // paths must run the nested closure on the current strand.
        pool.simple_parallel_for(8, |_| {
            pool.schedule(|| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_nested_parallel_for_runs_on_current_strand() {
        let pool = pool(3);
        let total = AtomicUsize::new(0);
        pool.parallel_for_fixed_block_size(64, 8, |first, last| {
            pool.parallel_for_fixed_block_size(last - first, 2, |a, b| {
                total.fetch_add(b - a, Ordering::Relaxed);
            });
        });
        assert_eq!(total.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_inline_pool_runs_on_caller() {
        let inline = ThreadPool::new(PoolOptions::new().with_degree_of_parallelism(1)).unwrap();
        let outside = std::thread::current().id();
        let calls = AtomicUsize::new(0);
        inline.simple_parallel_for(10, |_| {
            assert_eq!(std::thread::current().id(), outside);
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_try_parallel_for_without_pool() {
        let calls = AtomicUsize::new(0);
        try_parallel_for(None, 100, &OpCost::with_compute_cycles(1.0), |first, last| {
            assert_eq!((first, last), (0, 100));
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        try_parallel_for(None, 0, &OpCost::with_compute_cycles(1.0), |_, _| {
            panic!("empty loop must not invoke");
        });
    }

    #[test]
    fn test_loop_body_panic_reaches_caller() {
        let pool = pool(4);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.parallel_for_fixed_block_size(1000, 10, |first, _| {
                if first == 0 {
                    panic!("body failed");
                }
            });
        }));
        assert!(result.is_err());

        // The pool survives a failed loop.
        let calls = AtomicUsize::new(0);
        pool.parallel_for_fixed_block_size(100, 10, |first, last| {
            calls.fetch_add(last - first, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 100);
    }
}
