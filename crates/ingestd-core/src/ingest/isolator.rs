//! Per-dataset ingest for stragglers the bulk path gave up on.

use super::engine::filter_unregistered;
use super::raw::RawFallback;
use super::repair::{RepairOutcome, SchemaRepair};
use super::IngestStats;
use crate::catalog::{Catalog, FileDataset, TransferMode};
use crate::error::extract_cause;
use crate::{CatalogError, IsolationFailure};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument, Span};

/// Ingests one dataset at a time, with the same schema repair as the bulk
/// path and an optional raw fallback.
#[derive(Clone)]
pub struct Isolator {
    catalog: Arc<dyn Catalog>,
    raw: RawFallback,
    stats: Arc<IngestStats>,
    span: Span,
}

impl Isolator {
    /// Create an isolator sharing `raw` and `stats` with the bulk engine.
    pub fn new(catalog: Arc<dyn Catalog>, raw: RawFallback, stats: Arc<IngestStats>) -> Self {
        Self {
            catalog,
            raw,
            stats,
            span: tracing::info_span!("isolate"),
        }
    }

    /// Log through `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Register `dataset` on its own.
    ///
    /// Returns the terminal failure if it cannot be registered, by bulk call
    /// or by raw fallback when `allow_raw_fallback` is set.
    pub async fn isolate(
        &self,
        dataset: &FileDataset,
        transfer: TransferMode,
        allow_raw_fallback: bool,
    ) -> Result<(), IsolationFailure> {
        IngestStats::incr(&self.stats.isolations);
        let result = self
            .attempt(dataset, transfer, allow_raw_fallback)
            .instrument(self.span.clone())
            .await;
        if result.is_err() {
            IngestStats::incr(&self.stats.isolation_failures);
        }
        result
    }

    async fn attempt(
        &self,
        dataset: &FileDataset,
        transfer: TransferMode,
        allow_raw_fallback: bool,
    ) -> Result<(), IsolationFailure> {
        let single = std::slice::from_ref(dataset);
        let mut repair = SchemaRepair::default();

        let error = loop {
            IngestStats::incr(&self.stats.bulk_attempts);
            let error = match self.catalog.bulk_register(single, transfer).await {
                Ok(()) => {
                    info!(path = %dataset.path, "Ingested");
                    IngestStats::incr(&self.stats.files_ingested);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !error.is_repairable() {
                break error;
            }
            match repair
                .repair(self.catalog.as_ref(), &self.stats, &error, single)
                .await
            {
                RepairOutcome::Repaired => {
                    debug!(path = %dataset.path, "Retrying after repair");
                }
                RepairOutcome::Exhausted => break error,
                RepairOutcome::Failed(e) => {
                    break CatalogError::caused_by(
                        format!("repair failed after: {}", error),
                        e,
                    )
                }
            }
        };

        if filter_unregistered(self.catalog.as_ref(), single)
            .await
            .is_empty()
        {
            info!(path = %dataset.path, "Already registered");
            return Ok(());
        }

        if !allow_raw_fallback {
            let cause = extract_cause(&error);
            warn!(path = %dataset.path, cause = %cause, "Failed to ingest");
            return Err(IsolationFailure::new(dataset.path.clone(), cause));
        }

        warn!(
            path = %dataset.path,
            cause = %extract_cause(&error),
            "Bulk ingest failed, trying raw ingest"
        );
        let outcome = self
            .raw
            .run_raw(std::slice::from_ref(&dataset.path), transfer)
            .await;
        if outcome.succeeded_for(&dataset.path) {
            return Ok(());
        }

        let cause = outcome
            .failure_for(&dataset.path)
            .map(str::to_string)
            .unwrap_or_else(|| "raw ingest did not report the file as ingested".to_string());
        warn!(path = %dataset.path, cause = %cause, "Failed to ingest");
        Err(IsolationFailure::new(dataset.path.clone(), cause))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatasetRef, DatasetType, MemoryCatalog};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn dataset(path: &str) -> FileDataset {
        FileDataset::new(
            path,
            DatasetRef {
                id: Uuid::new_v4(),
                dataset_type: DatasetType {
                    name: "calexp".into(),
                    storage_class: "ExposureF".into(),
                    dimensions: vec!["instrument".into(), "visit".into()],
                },
                data_id: BTreeMap::new(),
                run: "HSC/runs/test".into(),
            },
        )
    }

    fn isolator(catalog: Arc<MemoryCatalog>) -> (Isolator, Arc<IngestStats>) {
        let stats = Arc::new(IngestStats::default());
        let raw = RawFallback::new(catalog.clone(), stats.clone());
        (Isolator::new(catalog, raw, stats.clone()), stats)
    }

    #[tokio::test]
    async fn test_isolate_repairs_schema() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        let (isolator, stats) = isolator(catalog.clone());
        let ds = dataset("/data/calexp.fits");

        isolator.isolate(&ds, TransferMode::Auto, false).await.unwrap();

        assert!(catalog.contains(&ds.refs[0].id));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dataset_type_repairs, 1);
        assert_eq!(snapshot.run_repairs, 1);
        assert_eq!(snapshot.bulk_attempts, 3);
        assert_eq!(snapshot.isolation_failures, 0);
    }

    #[tokio::test]
    async fn test_isolate_reports_location_and_cause() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        catalog.mark_unreadable("/data/bad.fits");
        let (isolator, stats) = isolator(catalog.clone());

        let failure = isolator
            .isolate(&dataset("/data/bad.fits"), TransferMode::Auto, false)
            .await
            .unwrap_err();

        assert_eq!(failure.location, "/data/bad.fits");
        assert!(failure.cause.contains("truncated"));
        assert_eq!(catalog.raw_ingest_calls(), 0);
        assert_eq!(stats.snapshot().isolation_failures, 1);
    }

    #[tokio::test]
    async fn test_isolate_already_registered() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        let (isolator, _) = isolator(catalog.clone());
        let ds = dataset("/data/calexp.fits");

        isolator.isolate(&ds, TransferMode::Auto, false).await.unwrap();
        isolator.isolate(&ds, TransferMode::Auto, false).await.unwrap();

        assert_eq!(catalog.dataset_count(), 1);
    }

    #[tokio::test]
    async fn test_isolate_raw_fallback() {
        let catalog = Arc::new(MemoryCatalog::new("/repo").with_instrument("HSC"));
        catalog.fail_bulk_calls(Some("registry unavailable".into()));
        let (isolator, stats) = isolator(catalog.clone());

        isolator
            .isolate(&dataset("/data/raw.fits"), TransferMode::Direct, true)
            .await
            .unwrap();

        assert!(catalog.contains_path("/data/raw.fits"));
        assert_eq!(stats.snapshot().raw_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_isolate_raw_fallback_failure() {
        let catalog = Arc::new(MemoryCatalog::new("/repo").with_instrument("HSC"));
        catalog.fail_bulk_calls(Some("registry unavailable".into()));
        catalog.mark_unreadable("/data/raw.fits");
        let (isolator, _) = isolator(catalog);

        let failure = isolator
            .isolate(&dataset("/data/raw.fits"), TransferMode::Direct, true)
            .await
            .unwrap_err();

        assert_eq!(failure.location, "/data/raw.fits");
    }
}
