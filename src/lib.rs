//! # parloop - Sharded Parallel-For Scheduling Engine
//!
//! A task-parallel loop executor for machine-learning inference workloads.
//! Given a loop of `n` iterations of roughly-uniform cost, the pool
//! partitions the iteration space across a fixed set of worker threads plus
//! the caller, executes the ranges in parallel, and returns once every
//! iteration has run exactly once.
//!
//! ## Architecture
//!
//! Three mechanisms carry the load:
//!
//! - **Sharded loop counter**: iterations are claimed from up to 8
//!   cache-line-aligned shards via atomic fetch-and-add, reducing counter
//!   contention and preserving worker-to-iteration affinity across loops.
//! - **Cost-model block sizing**: block sizes balance dispatch overhead
//!   against tail effect, derived from a per-iteration cost descriptor.
//! - **Parallel sections**: a scoped handle keeps workers spinning between
//!   successive loops, amortising wake-up costs for operators that issue
//!   many short loops.
//!
//! ## Example
//!
//! ```no_run
//! use parloop::{OpCost, PoolOptions, ThreadPool};
//!
//! let pool = ThreadPool::new(PoolOptions::new().with_degree_of_parallelism(8)).unwrap();
//!
//! let sum = std::sync::atomic::AtomicU64::new(0);
//! pool.parallel_for(1_000_000, &OpCost::new(8.0, 0.0, 10.0), |first, last| {
//!     let partial: u64 = (first as u64..last as u64).sum();
//!     sum.fetch_add(partial, std::sync::atomic::Ordering::Relaxed);
//! });
//! ```

pub mod cost;
pub mod counter;
pub mod error;
pub mod options;
pub mod pool;
mod profiler;
pub mod section;
mod worker;

pub use cost::OpCost;
pub use counter::LoopCounter;
pub use error::PoolError;
pub use options::PoolOptions;
pub use pool::{
    degree_of_parallelism, should_parallelize, try_parallel_for, try_simple_parallel_for,
    ThreadPool,
};
pub use section::{with_parallel_section, ParallelSection};
