//! Sharded loop counter for distributing iterations between claiming threads.
//!
//! A loop counter divides the iteration space of a parallel loop (perhaps
//! unevenly) between a small set of cache-line-aligned shards. Each thread
//! has a home shard from which it claims blocks of iterations via atomic
//! fetch-and-add, moving on to the other shards once its own is drained.
//! Compared with a single shared counter this reduces contention on loops
//! with many short iterations, and starting each thread at its home shard
//! promotes affinity between the work a thread performs in one loop and the
//! work it performs in the next.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Assumed size of a destructive-interference region. On platforms with
/// larger cache lines the shard padding must grow to match.
pub const CACHE_LINE_BYTES: usize = 64;

/// Upper bound on the number of shards, limiting both the inline footprint
/// of a [`LoopCounter`] and the work needed to confirm that every shard has
/// been drained at the end of a loop.
pub const MAX_SHARDS: usize = 8;

/// One cache line of the counter: the next unissued iteration and the
/// exclusive upper bound of the shard.
#[repr(align(64))]
struct Shard {
    next: AtomicUsize,
    end: usize,
}

const _: () = assert!(std::mem::size_of::<Shard>() == CACHE_LINE_BYTES);

impl Shard {
    const fn empty() -> Self {
        Shard {
            next: AtomicUsize::new(0),
            end: 0,
        }
    }
}

/// A fixed-capacity sharded counter over the iteration space `[0, n)`.
///
/// The counter occupies `MAX_SHARDS` cache lines inline regardless of the
/// loop length; no per-iteration allocation occurs. Visibility of the
/// initial shard values to worker threads is provided by the pool's
/// fork/join barrier, so the counter itself only needs the monotonicity of
/// fetch-and-add.
pub struct LoopCounter {
    shards: [Shard; MAX_SHARDS],
    num_shards: u32,
}

impl LoopCounter {
    /// Builds a counter for `num_iterations` iterations claimed in blocks of
    /// `block_size`, to be drained by up to `d_of_p` threads.
    ///
    /// If the iteration space does not divide evenly into shards of
    /// multiples of `block_size` then the final shard is left uneven.
    pub fn new(num_iterations: usize, d_of_p: usize, block_size: usize) -> Self {
        let num_shards = Self::shard_count(num_iterations, d_of_p, block_size);

        let num_blocks = num_iterations / block_size;
        let blocks_per_shard = num_blocks / num_shards;
        let iterations_per_shard = blocks_per_shard * block_size;

        let shards = std::array::from_fn(|shard| {
            if shard >= num_shards {
                return Shard::empty();
            }
            let is_last_shard = shard == num_shards - 1;
            Shard {
                next: AtomicUsize::new(shard * iterations_per_shard),
                end: if is_last_shard {
                    num_iterations
                } else {
                    (shard + 1) * iterations_per_shard
                },
            }
        });

        LoopCounter {
            shards,
            num_shards: num_shards as u32,
        }
    }

    /// Number of shards the iteration space was divided into.
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// The shard a thread with the given id starts claiming from.
    ///
    /// Worker ids are stable across loops on the same pool, so the same
    /// worker tends to claim the same iterations in back-to-back loops.
    /// This helps operators that run a series of short loops, such as GRU.
    pub fn home_shard(&self, id: u32) -> u32 {
        id % self.num_shards
    }

    /// Attempts to claim up to `block_size` iterations, starting from the
    /// shard at `*cursor` and rotating through the others until back at
    /// `home_shard`. Returns `None` once every shard is drained.
    ///
    /// A successful claim never crosses a shard boundary, so the returned
    /// range has a width in `[1, block_size]`.
    pub fn claim_iterations(
        &self,
        home_shard: u32,
        cursor: &mut u32,
        block_size: usize,
    ) -> Option<Range<usize>> {
        loop {
            let shard = &self.shards[*cursor as usize];
            if shard.next.load(Ordering::Relaxed) < shard.end {
                // Appears to be work in this shard; claim with fetch-and-add.
                // A racing loser may observe a start past the limit and fall
                // through to the rotation below without executing anything.
                let start = shard.next.fetch_add(block_size, Ordering::Relaxed);
                if start < shard.end {
                    return Some(start..shard.end.min(start + block_size));
                }
            }
            // This shard is exhausted; move to the next one, stopping once
            // we are back at the home shard.
            *cursor = (*cursor + 1) % self.num_shards;
            if *cursor == home_shard {
                return None;
            }
        }
    }

    // We require at least one block of work per shard, no more than
    // MAX_SHARDS shards, and no more shards than claiming threads. At low
    // thread counts each of N threads gets its own shard covering 1/N of
    // the work.
    fn shard_count(num_iterations: usize, d_of_p: usize, block_size: usize) -> usize {
        let num_blocks = num_iterations / block_size;
        let num_shards = if num_blocks == 0 {
            1
        } else {
            num_blocks.min(MAX_SHARDS)
        };
        num_shards.min(d_of_p.max(1))
    }
}
