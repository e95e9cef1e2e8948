//! Tests for the dynamic block-shrinking scheduling policy.

use parloop::{PoolOptions, ThreadPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[test]
fn test_dynamic_policy_covers_and_compresses_the_tail() {
    let pool = ThreadPool::new(
        PoolOptions::new()
            .with_degree_of_parallelism(9)
            .with_dynamic_block_base(4),
    )
    .unwrap();

    let n = 1_000_000usize;
    let base = (n as f64 / (9.0 * 4.0)).round() as usize;
    let total = AtomicUsize::new(0);

    pool.start_profiling();
    pool.parallel_for_fixed_block_size(n, base, |first, last| {
        assert!(last - first <= base);
        total.fetch_add(last - first, Ordering::Relaxed);
    });
    let report = pool.stop_profiling();

    assert_eq!(total.load(Ordering::Relaxed), n);

    // The driving thread logs the dispatch block size, every shrink it
    // performs, and the size the schedule converged to once the loop
    // drained. That sequence never increases and bottoms out at 1.
    let parsed: serde_json::Value = serde_json::from_str(&report).unwrap();
    let blocks: Vec<u64> = parsed["main_thread"]["block_size"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b.as_u64().unwrap())
        .collect();
    assert_eq!(blocks[0] as usize, base);
    assert!(
        blocks.windows(2).all(|w| w[0] >= w[1]),
        "block sizes increased: {:?}",
        blocks
    );
    assert_eq!(*blocks.last().unwrap(), 1, "final block size: {:?}", blocks);
}

#[test]
fn test_dynamic_policy_small_loop_still_exact() {
    let pool = ThreadPool::new(
        PoolOptions::new()
            .with_degree_of_parallelism(4)
            .with_dynamic_block_base(2),
    )
    .unwrap();

    let n = 1000usize;
    let hits: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
    pool.parallel_for_fixed_block_size(n, 8, |first, last| {
        for i in first..last {
            hits[i].fetch_add(1, Ordering::Relaxed);
        }
    });
    assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
}

#[test]
fn test_dynamic_base_zero_selects_static_policy() {
    let pool = ThreadPool::new(
        PoolOptions::new()
            .with_degree_of_parallelism(4)
            .with_dynamic_block_base(0),
    )
    .unwrap();

    // Under the static policy every non-tail block has exactly the
    // requested width.
    let widths = Mutex::new(Vec::new());
    pool.parallel_for_fixed_block_size(1024, 16, |first, last| {
        widths.lock().unwrap().push(last - first);
    });

    let widths = widths.into_inner().unwrap();
    assert!(widths.iter().all(|&w| w == 16));
    assert_eq!(widths.iter().sum::<usize>(), 1024);
}
