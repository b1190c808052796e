//! Reset-counter telemetry. Plain stdout telemetry, not a metrics-scrape
//! surface.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on tracked worker indices; workers beyond this are still
/// driven normally but do not get a counter slot (diagnostics-only
/// degradation, never a functional one).
pub const MAX_TRACKED_WORKERS: usize = 64;

/// How many resets worker 0 lets accumulate before printing a coalesced
/// dump.
const DUMP_EVERY: u64 = 64;

pub struct ResetCounters {
    counters: [AtomicU64; MAX_TRACKED_WORKERS],
}

impl Default for ResetCounters {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl ResetCounters {
    /// Record one reset for `worker_index`. When `verbose` is set, print a
    /// progress dot for every reset and, if this is worker 0 and the batch
    /// boundary was just crossed, a coalesced summary of every tracked
    /// worker's count. Silent otherwise. Relaxed atomics: this is telemetry,
    /// not a consistency barrier.
    pub fn record_reset(&self, worker_index: usize, verbose: bool) {
        if worker_index >= MAX_TRACKED_WORKERS {
            return;
        }
        let count = self.counters[worker_index].fetch_add(1, Ordering::Relaxed) + 1;

        if !verbose {
            return;
        }

        print!(".");
        let _ = std::io::stdout().flush();

        if worker_index == 0 && count % DUMP_EVERY == 0 {
            let totals: Vec<u64> = self.counters.iter().map(|c| c.load(Ordering::Relaxed)).collect();
            println!(
                "resets: {}",
                totals
                    .iter()
                    .enumerate()
                    .filter(|(_, &n)| n > 0)
                    .map(|(i, n)| format!("w{i}={n}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            );
        }
    }

    pub fn count_for(&self, worker_index: usize) -> u64 {
        self.counters
            .get(worker_index)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_worker() {
        let counters = ResetCounters::default();
        counters.record_reset(2, false);
        counters.record_reset(2, false);
        counters.record_reset(3, false);
        assert_eq!(counters.count_for(2), 2);
        assert_eq!(counters.count_for(3), 1);
        assert_eq!(counters.count_for(0), 0);
    }

    #[test]
    fn out_of_range_worker_index_is_ignored_not_a_panic() {
        let counters = ResetCounters::default();
        counters.record_reset(MAX_TRACKED_WORKERS + 1, false);
    }

    #[test]
    fn non_verbose_resets_still_accumulate_counts() {
        let counters = ResetCounters::default();
        counters.record_reset(1, false);
        assert_eq!(counters.count_for(1), 1);
    }
}
