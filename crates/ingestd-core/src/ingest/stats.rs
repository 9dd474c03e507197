//! Counters shared by the ingest components.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals across all batches.
#[derive(Debug, Default)]
pub struct IngestStats {
    /// Bulk register calls, isolation attempts included
    pub bulk_attempts: AtomicU64,
    /// Dataset types registered while repairing
    pub dataset_type_repairs: AtomicU64,
    /// Runs registered while repairing
    pub run_repairs: AtomicU64,
    /// Narrowing cycles that left work pending
    pub narrowing_cycles: AtomicU64,
    /// Datasets sent to the isolator
    pub isolations: AtomicU64,
    /// Datasets that failed isolation
    pub isolation_failures: AtomicU64,
    /// Raw ingest task runs
    pub raw_fallbacks: AtomicU64,
    /// Files confirmed ingested
    pub files_ingested: AtomicU64,
}

impl IngestStats {
    /// Add one to `counter`.
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to `counter`.
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            bulk_attempts: self.bulk_attempts.load(Ordering::Relaxed),
            dataset_type_repairs: self.dataset_type_repairs.load(Ordering::Relaxed),
            run_repairs: self.run_repairs.load(Ordering::Relaxed),
            narrowing_cycles: self.narrowing_cycles.load(Ordering::Relaxed),
            isolations: self.isolations.load(Ordering::Relaxed),
            isolation_failures: self.isolation_failures.load(Ordering::Relaxed),
            raw_fallbacks: self.raw_fallbacks.load(Ordering::Relaxed),
            files_ingested: self.files_ingested.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub bulk_attempts: u64,
    pub dataset_type_repairs: u64,
    pub run_repairs: u64,
    pub narrowing_cycles: u64,
    pub isolations: u64,
    pub isolation_failures: u64,
    pub raw_fallbacks: u64,
    pub files_ingested: u64,
}

impl IngestStatsSnapshot {
    /// Fraction of isolated datasets that were eventually ingested.
    pub fn isolation_success_rate(&self) -> f64 {
        if self.isolations == 0 {
            1.0
        } else {
            (self.isolations - self.isolation_failures) as f64 / self.isolations as f64
        }
    }
}
