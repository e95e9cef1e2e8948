//! Iteration cost model and block-size selection.
//!
//! Block sizes are chosen to balance two pressures: blocks that are too
//! small inflate dispatch overhead, blocks that are too large leave threads
//! idle at the tail of the loop. The selection starts from a floor derived
//! from the per-iteration cost and an oversharding budget, then greedily
//! coarsens while the parallel efficiency does not drop.

/// Cycles charged per byte loaded or stored, approximating the amortized
/// cost of streaming a cache line.
const LOAD_CYCLES_PER_BYTE: f64 = 11.0 / 64.0;
const STORE_CYCLES_PER_BYTE: f64 = 11.0 / 64.0;

/// Scaling from abstract compute cycles to device cycles.
const DEVICE_CYCLES_PER_COMPUTE_CYCLE: f64 = 1.0;

/// Fixed cost of entering a parallel loop at all, and the incremental cost
/// of enlisting one more thread. Loops cheaper than the startup cost run
/// inline on the caller.
const STARTUP_CYCLES: f64 = 100_000.0;
const PER_THREAD_CYCLES: f64 = 100_000.0;

/// Target size of one claimed block, in cycles.
const TASK_SIZE_CYCLES: f64 = 40_000.0;

/// At least this many blocks per thread, bounding the tail effect.
const MAX_OVERSHARDING_FACTOR: usize = 4;

/// Efficiency slack that keeps the coarsening loop from oscillating when
/// rounding makes two adjacent block counts indistinguishable.
const EFFICIENCY_SLACK: f64 = 0.01;

/// Cost of a single loop iteration, used to size blocks and decide whether
/// a loop is worth parallelizing at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpCost {
    pub bytes_loaded: f64,
    pub bytes_stored: f64,
    pub compute_cycles: f64,
}

impl OpCost {
    pub fn new(bytes_loaded: f64, bytes_stored: f64, compute_cycles: f64) -> Self {
        OpCost {
            bytes_loaded,
            bytes_stored,
            compute_cycles,
        }
    }

    /// A cost with no memory traffic, for compute-bound loop bodies.
    pub fn with_compute_cycles(compute_cycles: f64) -> Self {
        OpCost::new(0.0, 0.0, compute_cycles)
    }

    fn cycles_per_iteration(&self) -> f64 {
        self.bytes_loaded * LOAD_CYCLES_PER_BYTE
            + self.bytes_stored * STORE_CYCLES_PER_BYTE
            + self.compute_cycles * DEVICE_CYCLES_PER_COMPUTE_CYCLE
    }

    fn total_cycles(&self, num_iterations: usize) -> f64 {
        num_iterations as f64 * self.cycles_per_iteration()
    }

    /// Fraction of the task-size quantum one iteration consumes.
    pub(crate) fn task_size(&self) -> f64 {
        self.cycles_per_iteration() / TASK_SIZE_CYCLES
    }

    /// Estimated number of threads worth enlisting for a loop of
    /// `num_iterations`, clamped to `[1, max_threads]`.
    pub(crate) fn ideal_num_threads(&self, num_iterations: usize, max_threads: usize) -> usize {
        let total = self.total_cycles(num_iterations);
        if total <= STARTUP_CYCLES {
            return 1;
        }
        let threads = ((total - STARTUP_CYCLES) / PER_THREAD_CYCLES + 0.9) as usize;
        threads.clamp(1, max_threads)
    }
}

pub(crate) fn div_up(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

fn efficiency(block_count: usize, num_threads: usize) -> f64 {
    // Ratio of useful block slots to the rounded-up rectangle of
    // num_threads columns by ceil(block_count / num_threads) rows.
    block_count as f64 / (div_up(block_count, num_threads) * num_threads) as f64
}

/// Selects a block size for a loop of `n` iterations on `num_threads`
/// threads.
///
/// The initial size takes the larger of the oversharding floor (at least
/// `MAX_OVERSHARDING_FACTOR` blocks per thread) and the number of
/// iterations that fill one task-size quantum, then grows toward twice that
/// while parallel efficiency does not decrease by more than
/// `EFFICIENCY_SLACK`. The optional `block_align` hook may round a
/// candidate size up, e.g. to a vectorization boundary; it must never
/// shrink it.
pub(crate) fn calculate_block(
    n: usize,
    cost: &OpCost,
    block_align: Option<&dyn Fn(usize) -> usize>,
    num_threads: usize,
) -> usize {
    debug_assert!(n > 0 && num_threads > 0);

    let iterations_per_task = 1.0 / cost.task_size();
    let mut block_size = n.min(div_up(n, MAX_OVERSHARDING_FACTOR * num_threads).max(iterations_per_task as usize));
    let max_block_size = n.min(2 * block_size);

    if let Some(align) = block_align {
        let aligned = align(block_size);
        debug_assert!(aligned >= block_size);
        block_size = n.min(aligned);
    }

    let block_count = div_up(n, block_size);
    let mut max_efficiency = efficiency(block_count, num_threads);

    // Coarsen toward max_block_size as long as efficiency holds up. Each
    // step picks the next block size that yields one block fewer.
    let mut prev_block_count = block_count;
    while max_efficiency < 1.0 && prev_block_count > 1 {
        let mut coarser_block_size = div_up(n, prev_block_count - 1);
        if let Some(align) = block_align {
            let aligned = align(coarser_block_size);
            debug_assert!(aligned >= coarser_block_size);
            coarser_block_size = n.min(aligned);
        }
        if coarser_block_size > max_block_size {
            break;
        }
        let coarser_block_count = div_up(n, coarser_block_size);
        debug_assert!(coarser_block_count < prev_block_count);
        prev_block_count = coarser_block_count;
        let coarser_efficiency = efficiency(coarser_block_count, num_threads);
        if coarser_efficiency + EFFICIENCY_SLACK >= max_efficiency {
            block_size = coarser_block_size;
            if max_efficiency < coarser_efficiency {
                max_efficiency = coarser_efficiency;
            }
        }
    }

    block_size
}
