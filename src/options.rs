//! Pool construction options.

use core_affinity::CoreId;

use crate::error::PoolError;

/// Configuration accepted at pool construction.
///
/// The degree of parallelism counts the caller thread: a pool with degree
/// `d` creates `d - 1` workers and the thread entering a loop supplies the
/// remaining strand. A degree of 1 creates no workers at all and every
/// loop runs inline.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Total parallel strands including the caller. Must be at least 1.
    pub degree_of_parallelism: usize,
    /// Optional pool name, used for worker thread names and in profiler
    /// reports.
    pub name: Option<String>,
    /// Optional core pinning. The first entry is reserved for the caller
    /// thread; workers take the remaining entries in order.
    pub affinity: Option<Vec<CoreId>>,
    /// Favour spinning over parking when idle.
    pub low_latency_hint: bool,
    /// Treat the CPU as hybrid, oversubscribing block counts to smooth over
    /// heterogeneous core speeds.
    pub force_hybrid: bool,
    /// `<= 0` selects the static scheduling policy; positive values select
    /// the dynamic policy with a target block count of
    /// `degree_of_parallelism * dynamic_block_base`.
    pub dynamic_block_base: i64,
}

impl PoolOptions {
    /// Options with one strand per logical CPU and the static policy.
    pub fn new() -> Self {
        PoolOptions {
            degree_of_parallelism: num_cpus::get(),
            name: None,
            affinity: None,
            low_latency_hint: false,
            force_hybrid: false,
            dynamic_block_base: 0,
        }
    }

    pub fn with_degree_of_parallelism(mut self, degree: usize) -> Self {
        self.degree_of_parallelism = degree;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_affinity(mut self, affinity: Vec<CoreId>) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn with_low_latency_hint(mut self, hint: bool) -> Self {
        self.low_latency_hint = hint;
        self
    }

    pub fn with_force_hybrid(mut self, force: bool) -> Self {
        self.force_hybrid = force;
        self
    }

    pub fn with_dynamic_block_base(mut self, base: i64) -> Self {
        self.dynamic_block_base = base;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if self.degree_of_parallelism < 1 {
            return Err(PoolError::InvalidOptions(
                "degree_of_parallelism must be at least 1".into(),
            ));
        }
        if let Some(affinity) = &self.affinity {
            // One entry for the caller plus one per worker.
            if affinity.len() < self.degree_of_parallelism {
                return Err(PoolError::InvalidOptions(format!(
                    "affinity list has {} entries, need {}",
                    affinity.len(),
                    self.degree_of_parallelism
                )));
            }
        }
        Ok(())
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_degree_counts_cpus() {
        let options = PoolOptions::new();
        assert!(options.degree_of_parallelism >= 1);
        assert_eq!(options.dynamic_block_base, 0);
    }

    #[test]
    fn test_zero_degree_rejected() {
        let options = PoolOptions::new().with_degree_of_parallelism(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_short_affinity_list_rejected() {
        let options = PoolOptions::new()
            .with_degree_of_parallelism(4)
            .with_affinity(vec![CoreId { id: 0 }, CoreId { id: 1 }]);
        assert!(options.validate().is_err());
    }
}
