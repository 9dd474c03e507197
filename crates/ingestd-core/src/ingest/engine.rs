//! Bulk registration with repair, narrowing and isolation.
//!
//! A batch moves through these states:
//!
//! ```text
//! Attempting --ok--> Done
//!     |
//!     +--missing type/run--> Repairing --> Attempting
//!     |
//!     +--other error--> Narrowing --+--nothing pending--> Done
//!                                   +--budget left--> Attempting
//!                                   +--budget spent--> Isolating --> Done
//! ```
//!
//! When raw fallback is allowed, the first non-repairable error hands the
//! whole batch to the raw ingest task instead of narrowing.
//!
//! Narrowing gets `len + 2` cycles before the remaining datasets are
//! isolated. Repairs do not count against it.

use super::isolator::Isolator;
use super::raw::{RawFallback, RawIngestOutcome};
use super::repair::{RepairOutcome, SchemaRepair};
use super::IngestStats;
use crate::catalog::{Catalog, FileDataset, TransferMode};
use crate::error::extract_cause;
use crate::IsolationFailure;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

/// What happened to one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Locations confirmed registered, in the order they were confirmed
    pub ingested: Vec<String>,
    /// Datasets that failed isolation
    pub failures: Vec<IsolationFailure>,
    /// Set when the batch went to the raw ingest task
    pub raw_fallback: Option<RawIngestOutcome>,
    /// Bulk calls made for the whole batch, isolation excluded
    pub bulk_attempts: usize,
    /// Narrowing cycles that retried a smaller batch
    pub narrowing_cycles: usize,
}

impl BatchReport {
    /// Whether every dataset ended up registered.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
            && self
                .raw_fallback
                .as_ref()
                .map_or(true, |outcome| outcome.failed.is_empty())
    }
}

/// Registers batches of datasets, recovering from partial failure.
#[derive(Clone)]
pub struct BulkIngestEngine {
    catalog: Arc<dyn Catalog>,
    isolator: Isolator,
    raw: RawFallback,
    stats: Arc<IngestStats>,
    span: Span,
}

impl BulkIngestEngine {
    /// Create an engine over `catalog`, counting into `stats`.
    pub fn new(catalog: Arc<dyn Catalog>, stats: Arc<IngestStats>) -> Self {
        let raw = RawFallback::new(catalog.clone(), stats.clone());
        let isolator = Isolator::new(catalog.clone(), raw.clone(), stats.clone());
        Self {
            catalog,
            isolator,
            raw,
            stats,
            span: tracing::info_span!("bulk_ingest"),
        }
    }

    /// Log through `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Register `datasets` with as few catalog calls as the failures allow.
    ///
    /// Never fails as a whole. Datasets that cannot be registered even one at
    /// a time are listed in [`BatchReport::failures`].
    pub async fn ingest_batch(
        &self,
        datasets: &[FileDataset],
        transfer: TransferMode,
        allow_raw_fallback: bool,
    ) -> BatchReport {
        self.run(datasets, transfer, allow_raw_fallback)
            .instrument(self.span.clone())
            .await
    }

    async fn run(
        &self,
        datasets: &[FileDataset],
        transfer: TransferMode,
        allow_raw_fallback: bool,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        if datasets.is_empty() {
            return report;
        }

        let mut pending = datasets.to_vec();
        let mut budget = datasets.len() + 2;
        let mut repair = SchemaRepair::default();

        info!(datasets = datasets.len(), %transfer, "Ingesting batch");

        loop {
            report.bulk_attempts += 1;
            IngestStats::incr(&self.stats.bulk_attempts);

            let error = match self.catalog.bulk_register(&pending, transfer).await {
                Ok(()) => {
                    for dataset in &pending {
                        info!(path = %dataset.path, "Ingested");
                    }
                    self.confirm(&mut report, pending);
                    break;
                }
                Err(e) => e,
            };

            if error.is_repairable() {
                match repair
                    .repair(self.catalog.as_ref(), &self.stats, &error, &pending)
                    .await
                {
                    RepairOutcome::Repaired => {
                        pending = self.narrow(&mut report, pending).await;
                        if pending.is_empty() {
                            break;
                        }
                        debug!(pending = pending.len(), "Retrying after repair");
                        continue;
                    }
                    RepairOutcome::Exhausted => {
                        debug!(error = %error, "Nothing left to repair");
                    }
                    RepairOutcome::Failed(e) => {
                        warn!(error = %error, cause = %extract_cause(&e), "Repair failed");
                    }
                }
            }

            if allow_raw_fallback {
                warn!(
                    datasets = datasets.len(),
                    cause = %extract_cause(&error),
                    "Bulk ingest failed, handing batch to raw ingest"
                );
                let paths: Vec<String> = datasets.iter().map(|d| d.path.clone()).collect();
                report.raw_fallback = Some(self.raw.run_raw(&paths, transfer).await);
                break;
            }

            let before = pending.len();
            pending = self.narrow(&mut report, pending).await;
            if pending.is_empty() {
                break;
            }

            if budget > 0 {
                budget -= 1;
                report.narrowing_cycles += 1;
                IngestStats::incr(&self.stats.narrowing_cycles);
                info!(
                    pending = pending.len(),
                    confirmed = before - pending.len(),
                    budget,
                    cause = %extract_cause(&error),
                    "Retrying remaining datasets"
                );
                continue;
            }

            warn!(
                pending = pending.len(),
                cause = %extract_cause(&error),
                "Narrowing budget spent, isolating remaining datasets"
            );
            for dataset in pending {
                match self
                    .isolator
                    .isolate(&dataset, transfer, allow_raw_fallback)
                    .await
                {
                    Ok(()) => report.ingested.push(dataset.path),
                    Err(failure) => report.failures.push(failure),
                }
            }
            break;
        }

        info!(
            ingested = report.ingested.len(),
            failed = report.failures.len(),
            attempts = report.bulk_attempts,
            "Batch finished"
        );
        report
    }

    /// Move everything already registered out of `pending`.
    async fn narrow(
        &self,
        report: &mut BatchReport,
        pending: Vec<FileDataset>,
    ) -> Vec<FileDataset> {
        let remaining = filter_unregistered(self.catalog.as_ref(), &pending).await;
        let confirmed: Vec<FileDataset> = pending
            .into_iter()
            .filter(|d| !remaining.contains(d))
            .collect();
        self.confirm(report, confirmed);
        remaining
    }

    fn confirm(&self, report: &mut BatchReport, datasets: Vec<FileDataset>) {
        IngestStats::add(&self.stats.files_ingested, datasets.len());
        report
            .ingested
            .extend(datasets.into_iter().map(|dataset| dataset.path));
    }
}

/// Datasets in `pending` none of whose references is registered.
///
/// Each ID is looked up once. A failed lookup counts as not registered.
pub(crate) async fn filter_unregistered(
    catalog: &dyn Catalog,
    pending: &[FileDataset],
) -> Vec<FileDataset> {
    let mut known: HashMap<Uuid, bool> = HashMap::new();
    let mut remaining = Vec::new();

    for dataset in pending {
        let mut registered = false;
        for id in dataset.ids() {
            let exists = match known.get(&id) {
                Some(exists) => *exists,
                None => {
                    let exists = match catalog.get_dataset(id).await {
                        Ok(found) => found.is_some(),
                        Err(e) => {
                            warn!(id = %id, error = %e, "Dataset lookup failed");
                            false
                        }
                    };
                    known.insert(id, exists);
                    exists
                }
            };
            if exists {
                registered = true;
                break;
            }
        }
        if !registered {
            remaining.push(dataset.clone());
        }
    }

    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatasetRef, DatasetType, MemoryCatalog};
    use std::collections::BTreeMap;

    fn dataset(path: &str, type_name: &str, run: &str) -> FileDataset {
        FileDataset::new(
            path,
            DatasetRef {
                id: Uuid::new_v4(),
                dataset_type: DatasetType {
                    name: type_name.into(),
                    storage_class: "ExposureF".into(),
                    dimensions: vec!["instrument".into(), "visit".into()],
                },
                data_id: BTreeMap::new(),
                run: run.into(),
            },
        )
    }

    fn engine(catalog: Arc<MemoryCatalog>) -> BulkIngestEngine {
        BulkIngestEngine::new(catalog, Arc::new(IngestStats::default()))
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        let report = engine(catalog.clone())
            .ingest_batch(&[], TransferMode::Auto, false)
            .await;

        assert_eq!(report, BatchReport::default());
        assert_eq!(catalog.bulk_calls(), 0);
    }

    #[tokio::test]
    async fn test_repairs_each_type_once() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        let batch = vec![
            dataset("/data/a.fits", "calexp", "run/1"),
            dataset("/data/b.fits", "calexp", "run/1"),
            dataset("/data/c.fits", "src", "run/2"),
        ];

        let report = engine(catalog.clone())
            .ingest_batch(&batch, TransferMode::Auto, false)
            .await;

        assert!(report.is_complete());
        assert_eq!(report.ingested.len(), 3);
        assert_eq!(report.bulk_attempts, 3);
        assert_eq!(catalog.dataset_type_registrations(), 2);
        assert_eq!(catalog.run_registrations(), 2);
    }

    #[tokio::test]
    async fn test_partial_commit_narrows() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        catalog.add_dataset_type(dataset("/x", "calexp", "r").refs[0].dataset_type.clone());
        catalog.add_run("run/1");
        catalog.mark_unreadable("/data/bad.fits");
        let batch = vec![
            dataset("/data/good.fits", "calexp", "run/1"),
            dataset("/data/bad.fits", "calexp", "run/1"),
        ];

        let report = engine(catalog.clone())
            .ingest_batch(&batch, TransferMode::Auto, false)
            .await;

        assert_eq!(report.ingested, vec!["/data/good.fits"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].location, "/data/bad.fits");
        // first call, four retries of the straggler, one isolation call
        assert_eq!(report.narrowing_cycles, 4);
        assert_eq!(catalog.bulk_calls(), 6);
    }

    #[tokio::test]
    async fn test_lookups_are_deduplicated() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        catalog.add_dataset_type(dataset("/x", "calexp", "r").refs[0].dataset_type.clone());
        catalog.add_run("run/1");
        let shared = dataset("/data/a.fits", "calexp", "run/1");
        let mut twin = shared.clone();
        twin.path = "/data/a-copy.fits".into();

        let remaining = filter_unregistered(catalog.as_ref(), &[shared, twin]).await;

        assert_eq!(remaining.len(), 2);
        assert_eq!(catalog.lookups(), 1);
    }

    #[tokio::test]
    async fn test_raw_fallback_takes_whole_batch() {
        let catalog = Arc::new(MemoryCatalog::new("/repo").with_instrument("HSC"));
        catalog.fail_bulk_calls(Some("formatter not importable".into()));
        let batch = vec![
            dataset("/data/a.fits", "calexp", "run/1"),
            dataset("/data/b.fits", "calexp", "run/1"),
        ];

        let report = engine(catalog.clone())
            .ingest_batch(&batch, TransferMode::Direct, true)
            .await;

        let outcome = report.raw_fallback.as_ref().unwrap();
        assert_eq!(outcome.succeeded, vec!["/data/a.fits", "/data/b.fits"]);
        assert_eq!(catalog.bulk_calls(), 1);
        assert_eq!(catalog.raw_ingest_calls(), 1);
        assert!(report.is_complete());
    }
}
