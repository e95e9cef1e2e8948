//! Observable behaviour of the pool profiler.

use parloop::{PoolOptions, ThreadPool};
use std::sync::atomic::{AtomicUsize, Ordering};

fn pool(degree: usize) -> ThreadPool {
    ThreadPool::new(
        PoolOptions::new()
            .with_degree_of_parallelism(degree)
            .with_name("profiled"),
    )
    .unwrap()
}

#[test]
fn test_report_structure_after_loops() {
    let pool = pool(5);
    pool.start_profiling();

    let total = AtomicUsize::new(0);
    for _ in 0..3 {
        pool.parallel_for_fixed_block_size(10_000, 50, |first, last| {
            total.fetch_add(last - first, Ordering::Relaxed);
        });
    }
    let report = pool.stop_profiling();
    assert_eq!(total.load(Ordering::Relaxed), 30_000);

    let parsed: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(parsed["main_thread"]["thread_pool_name"], "profiled");

    // One block-size entry per dispatched loop.
    let blocks = parsed["main_thread"]["block_size"].as_array().unwrap();
    assert_eq!(blocks.len(), 3);
    assert!(blocks.iter().all(|b| b == 50));

    for name in ["Distribution", "DistributionEnqueue", "Run", "Wait", "WaitRevoke"] {
        assert!(
            parsed["main_thread"]["events"].get(name).is_some(),
            "missing event key {}",
            name
        );
    }

    // One record per worker.
    let workers = parsed["sub_threads"].as_array().unwrap();
    assert_eq!(workers.len(), 4);
    let runs: u64 = workers.iter().map(|w| w["num_run"].as_u64().unwrap()).sum();
    assert!(runs > 0, "no worker ever picked up a work item");
}

#[test]
fn test_profiling_disabled_records_nothing() {
    let pool = pool(3);
    pool.parallel_for_fixed_block_size(1000, 10, |_, _| {});

    pool.start_profiling();
    let report = pool.stop_profiling();
    let parsed: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert!(parsed["main_thread"]["block_size"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[test]
fn test_inline_pool_report_is_empty() {
    let inline = ThreadPool::new(PoolOptions::new().with_degree_of_parallelism(1)).unwrap();
    inline.start_profiling();
    assert_eq!(inline.stop_profiling(), "");
}

#[test]
fn test_section_loops_use_enqueue_event() {
    let pool = pool(5);
    pool.start_profiling();
    parloop::with_parallel_section(&pool, |_section| {
        pool.parallel_for_fixed_block_size(100_000, 100, |_, _| {});
    });
    let report = pool.stop_profiling();
    let parsed: serde_json::Value = serde_json::from_str(&report).unwrap();

    // In-section dispatch is timed under DistributionEnqueue; nothing ran
    // outside a section.
    let events = &parsed["main_thread"]["events"];
    assert_eq!(events["Distribution"], 0);
}
