//! Pool profiler: per-main-thread event timings and per-worker run counts.
//!
//! The profiler is a single on/off flag plus two stores: a thread-local
//! record for whichever thread drives loops (timestamp stack, block sizes,
//! CPU identity) and a fixed array of per-worker records written by the
//! workers themselves. Nothing escapes until [`Profiler::stop`] serializes
//! a report. All logging calls short-circuit while disabled, keeping the
//! hot path to a single relaxed load.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use serde::Serialize;

lazy_static::lazy_static! {
    // Monotonic epoch for storing timestamps in per-worker atomics.
    static ref EPOCH: Instant = Instant::now();
}

/// Worker CPU identity is refreshed at most this often, bounding syscall
/// overhead on short runs.
const CORE_SAMPLE_INTERVAL_US: u64 = 10_000;

/// Phases of a dispatched loop, timed on the driving thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// Distributing work items to workers outside a parallel section.
    Distribution,
    /// Distributing work items to the active parallel section.
    DistributionEnqueue,
    /// The caller running its own share of the loop.
    Run,
    /// Waiting on the join barrier.
    Wait,
    /// Tearing down a parallel section.
    WaitRevoke,
}

const NUM_EVENTS: usize = 5;

impl Event {
    fn name(self) -> &'static str {
        match self {
            Event::Distribution => "Distribution",
            Event::DistributionEnqueue => "DistributionEnqueue",
            Event::Run => "Run",
            Event::Wait => "Wait",
            Event::WaitRevoke => "WaitRevoke",
        }
    }

    const ALL: [Event; NUM_EVENTS] = [
        Event::Distribution,
        Event::DistributionEnqueue,
        Event::Run,
        Event::Wait,
        Event::WaitRevoke,
    ];
}

struct MainThreadStat {
    points: Vec<Instant>,
    blocks: Vec<usize>,
    events: [u64; NUM_EVENTS],
    core: i64,
}

impl Default for MainThreadStat {
    fn default() -> Self {
        MainThreadStat {
            points: Vec::new(),
            blocks: Vec::new(),
            events: [0; NUM_EVENTS],
            core: -1,
        }
    }
}

impl MainThreadStat {
    fn log_start(&mut self) {
        self.points.push(Instant::now());
    }

    fn log_end(&mut self, event: Event) {
        let start = self
            .points
            .pop()
            .expect("log_start must pair with log_end");
        self.events[event as usize] += start.elapsed().as_micros() as u64;
    }

    fn log_end_and_start(&mut self, event: Event) {
        let start = self
            .points
            .last_mut()
            .expect("log_start must pair with log_end");
        self.events[event as usize] += start.elapsed().as_micros() as u64;
        *start = Instant::now();
    }

    fn log_core(&mut self) {
        self.core = current_cpu();
    }

    fn log_block_size(&mut self, block_size: usize) {
        self.blocks.push(block_size);
    }

    // Drains the record into a report. The timestamp stack must be balanced
    // by now.
    fn reset(&mut self, pool_name: &str) -> MainThreadReport {
        assert!(
            self.points.is_empty(),
            "log_start must pair with log_end before stopping the profiler"
        );
        let report = MainThreadReport {
            thread_pool_name: pool_name.to_string(),
            thread_id: format!("{:?}", thread::current().id()),
            block_size: std::mem::take(&mut self.blocks),
            core: self.core,
            events: Event::ALL
                .iter()
                .map(|&e| (e.name(), self.events[e as usize]))
                .collect(),
        };
        self.events = [0; NUM_EVENTS];
        report
    }
}

thread_local! {
    static MAIN_STAT: RefCell<MainThreadStat> = RefCell::new(MainThreadStat::default());
}

struct WorkerStat {
    num_run: AtomicU64,
    core: AtomicI64,
    last_sample_us: AtomicU64,
}

impl WorkerStat {
    fn new() -> Self {
        WorkerStat {
            num_run: AtomicU64::new(0),
            core: AtomicI64::new(-1),
            last_sample_us: AtomicU64::new(0),
        }
    }
}

#[derive(Serialize)]
struct MainThreadReport {
    thread_pool_name: String,
    thread_id: String,
    block_size: Vec<usize>,
    core: i64,
    events: BTreeMap<&'static str, u64>,
}

#[derive(Serialize)]
struct WorkerReport {
    worker: usize,
    num_run: u64,
    core: i64,
}

#[derive(Serialize)]
struct ProfileReport {
    main_thread: MainThreadReport,
    sub_threads: Vec<WorkerReport>,
}

/// Collects statistics for one pool. Owned by the worker pool so both the
/// driving thread and the workers can reach it.
pub(crate) struct Profiler {
    enabled: AtomicBool,
    pool_name: String,
    workers: Vec<WorkerStat>,
}

impl Profiler {
    pub(crate) fn new(pool_name: String, num_workers: usize) -> Self {
        Profiler {
            enabled: AtomicBool::new(false),
            pool_name,
            workers: (0..num_workers).map(|_| WorkerStat::new()).collect(),
        }
    }

    pub(crate) fn start(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disables collection and serializes everything gathered since
    /// [`start`](Self::start) as a JSON report.
    ///
    /// Panics if the profiler was never started or if the calling thread
    /// has an unbalanced timestamp stack.
    pub(crate) fn stop(&self) -> String {
        assert!(
            self.enabled.swap(false, Ordering::Relaxed),
            "profiler was not started"
        );
        let main_thread = MAIN_STAT.with(|stat| stat.borrow_mut().reset(&self.pool_name));
        let sub_threads = self
            .workers
            .iter()
            .enumerate()
            .map(|(idx, stat)| WorkerReport {
                worker: idx,
                num_run: stat.num_run.load(Ordering::Relaxed),
                core: stat.core.load(Ordering::Relaxed),
            })
            .collect();
        let report = ProfileReport {
            main_thread,
            sub_threads,
        };
        serde_json::to_string(&report).expect("profile report serialization cannot fail")
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn log_start(&self) {
        if self.is_enabled() {
            MAIN_STAT.with(|stat| stat.borrow_mut().log_start());
        }
    }

    pub(crate) fn log_end(&self, event: Event) {
        if self.is_enabled() {
            MAIN_STAT.with(|stat| stat.borrow_mut().log_end(event));
        }
    }

    pub(crate) fn log_end_and_start(&self, event: Event) {
        if self.is_enabled() {
            MAIN_STAT.with(|stat| stat.borrow_mut().log_end_and_start(event));
        }
    }

    /// Appends one block size to the calling thread's record. The dynamic
    /// scheduling policy uses this to expose its shrinking block sizes.
    pub(crate) fn log_block_size(&self, block_size: usize) {
        if self.is_enabled() {
            MAIN_STAT.with(|stat| stat.borrow_mut().log_block_size(block_size));
        }
    }

    /// Fused entry point for the start of a dispatch: records the caller's
    /// CPU, the chosen block size, and opens the first timing interval.
    pub(crate) fn log_start_and_core_and_block(&self, block_size: usize) {
        if self.is_enabled() {
            MAIN_STAT.with(|stat| {
                let mut stat = stat.borrow_mut();
                stat.log_core();
                stat.log_block_size(block_size);
                stat.log_start();
            });
        }
    }

    /// Called by a worker each time it picks up a work item.
    pub(crate) fn log_run(&self, worker_idx: usize) {
        if !self.is_enabled() {
            return;
        }
        let stat = &self.workers[worker_idx];
        stat.num_run.fetch_add(1, Ordering::Relaxed);

        let now_us = EPOCH.elapsed().as_micros() as u64;
        let last = stat.last_sample_us.load(Ordering::Relaxed);
        if stat.core.load(Ordering::Relaxed) < 0 || now_us.saturating_sub(last) > CORE_SAMPLE_INTERVAL_US
        {
            stat.core.store(current_cpu(), Ordering::Relaxed);
            stat.last_sample_us.store(now_us, Ordering::Relaxed);
        }
    }
}

#[cfg(target_os = "linux")]
fn current_cpu() -> i64 {
    // SAFETY: sched_getcpu has no preconditions.
    unsafe { libc::sched_getcpu() as i64 }
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> i64 {
    -1
}
