//! Mapping from pipeline parallelism policy to a concrete merge strategy

use crate::config::{OrderingMode, ThreadSafety};
use serde::{Deserialize, Serialize};

/// Pipeline-level parallelism policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Parallelism {
    /// Never run step invocations concurrently.
    Sequential,
    /// Parallelize where the step declares it is safe to do so.
    #[default]
    Auto,
    /// Parallelize wherever possible; warns when a step forbids it.
    Parallel,
}

/// How a step's per-item work is folded back into the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// One item at a time, order fully preserved.
    Concat,
    /// Up to `concurrency` items in flight at once.
    Merge { concurrency: usize },
}

impl MergeStrategy {
    /// In-flight invocation budget implied by the strategy.
    pub fn concurrency(&self) -> usize {
        match self {
            MergeStrategy::Concat => 1,
            MergeStrategy::Merge { concurrency } => *concurrency,
        }
    }
}

/// Pick the merge strategy for one step.
///
/// Only a step that relaxes ordering *and* declares a thread-safe user
/// function is ever merged. A `Parallel` request that the step forbids
/// degrades to `Concat` with a composition-time warning.
pub fn merge_strategy(
    policy: Parallelism,
    ordering: OrderingMode,
    thread_safety: ThreadSafety,
    max_concurrency: usize,
    step: &str,
) -> MergeStrategy {
    let eligible = ordering == OrderingMode::Relaxed && thread_safety == ThreadSafety::Safe;
    match policy {
        Parallelism::Sequential => MergeStrategy::Concat,
        Parallelism::Auto => {
            if eligible {
                MergeStrategy::Merge { concurrency: max_concurrency.max(1) }
            } else {
                MergeStrategy::Concat
            }
        }
        Parallelism::Parallel => {
            if eligible {
                MergeStrategy::Merge { concurrency: max_concurrency.max(1) }
            } else {
                tracing::warn!(
                    step,
                    ?ordering,
                    ?thread_safety,
                    "PARALLEL requested but step forbids it; falling back to sequential"
                );
                MergeStrategy::Concat
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_always_concatenates() {
        for ordering in [OrderingMode::Strict, OrderingMode::Relaxed] {
            for safety in [ThreadSafety::Safe, ThreadSafety::Unsafe] {
                let strategy =
                    merge_strategy(Parallelism::Sequential, ordering, safety, 128, "s");
                assert_eq!(strategy, MergeStrategy::Concat);
            }
        }
    }

    #[test]
    fn auto_merges_only_relaxed_and_safe() {
        assert_eq!(
            merge_strategy(Parallelism::Auto, OrderingMode::Relaxed, ThreadSafety::Safe, 128, "s"),
            MergeStrategy::Merge { concurrency: 128 }
        );
        assert_eq!(
            merge_strategy(Parallelism::Auto, OrderingMode::Strict, ThreadSafety::Safe, 128, "s"),
            MergeStrategy::Concat
        );
        assert_eq!(
            merge_strategy(Parallelism::Auto, OrderingMode::Relaxed, ThreadSafety::Unsafe, 128, "s"),
            MergeStrategy::Concat
        );
    }

    #[test]
    fn parallel_degrades_when_forbidden() {
        assert_eq!(
            merge_strategy(Parallelism::Parallel, OrderingMode::Strict, ThreadSafety::Safe, 64, "s"),
            MergeStrategy::Concat
        );
        assert_eq!(
            merge_strategy(Parallelism::Parallel, OrderingMode::Relaxed, ThreadSafety::Safe, 64, "s"),
            MergeStrategy::Merge { concurrency: 64 }
        );
    }

    #[test]
    fn zero_concurrency_clamped() {
        let strategy =
            merge_strategy(Parallelism::Auto, OrderingMode::Relaxed, ThreadSafety::Safe, 0, "s");
        assert_eq!(strategy, MergeStrategy::Merge { concurrency: 1 });
        assert_eq!(strategy.concurrency(), 1);
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!(serde_json::from_str::<Parallelism>("\"AUTO\"").unwrap(), Parallelism::Auto);
        assert_eq!(
            serde_json::from_str::<Parallelism>("\"SEQUENTIAL\"").unwrap(),
            Parallelism::Sequential
        );
    }
}
