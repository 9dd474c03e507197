//! Raw-exposure ingest, used for raw files and as the last resort for
//! datasets the bulk path cannot register.

use super::IngestStats;
use crate::catalog::{Catalog, FileDataset, RawIngestObserver, TransferMode};
use crate::error::extract_cause;
use crate::CatalogError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn, Instrument, Span};

/// Per-file results of one raw ingest run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawIngestOutcome {
    /// Files the task reported as stored
    pub succeeded: Vec<String>,
    /// Files that failed, with their cause
    pub failed: Vec<(String, String)>,
}

impl RawIngestOutcome {
    /// Whether `path` was stored.
    pub fn succeeded_for(&self, path: &str) -> bool {
        self.succeeded.iter().any(|p| p == path)
    }

    /// Cause recorded for `path`, if it failed.
    pub fn failure_for(&self, path: &str) -> Option<&str> {
        self.failed
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, cause)| cause.as_str())
    }
}

/// Collects and logs task callbacks.
#[derive(Default)]
struct OutcomeCollector {
    outcome: Mutex<RawIngestOutcome>,
}

impl RawIngestObserver for OutcomeCollector {
    fn on_success(&self, datasets: &[FileDataset]) {
        let mut outcome = self.outcome.lock();
        for dataset in datasets {
            info!(path = %dataset.path, "Raw file ingested");
            outcome.succeeded.push(dataset.path.clone());
        }
    }

    fn on_ingest_failure(&self, files: &[String], error: &CatalogError) {
        let cause = extract_cause(error);
        let mut outcome = self.outcome.lock();
        for file in files {
            warn!(path = %file, cause = %cause, "Raw ingest failed");
            outcome.failed.push((file.clone(), cause.clone()));
        }
    }

    fn on_metadata_failure(&self, path: &str, error: &CatalogError) {
        let cause = extract_cause(error);
        warn!(path = %path, cause = %cause, "Raw metadata extraction failed");
        self.outcome.lock().failed.push((path.to_string(), cause));
    }
}

/// Runs the raw ingest task and reports what happened to each file.
#[derive(Clone)]
pub struct RawFallback {
    catalog: Arc<dyn Catalog>,
    stats: Arc<IngestStats>,
    span: Span,
}

impl RawFallback {
    /// Create an adapter over `catalog`.
    pub fn new(catalog: Arc<dyn Catalog>, stats: Arc<IngestStats>) -> Self {
        Self {
            catalog,
            stats,
            span: tracing::info_span!("raw_ingest"),
        }
    }

    /// Log through `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Ingest `paths` with the raw task.
    ///
    /// Never fails: if the task cannot run at all, every path is reported as
    /// failed with the task's error.
    pub async fn run_raw(&self, paths: &[String], transfer: TransferMode) -> RawIngestOutcome {
        self.run(paths, transfer).instrument(self.span.clone()).await
    }

    async fn run(&self, paths: &[String], transfer: TransferMode) -> RawIngestOutcome {
        if paths.is_empty() {
            return RawIngestOutcome::default();
        }

        IngestStats::incr(&self.stats.raw_fallbacks);
        info!(files = paths.len(), %transfer, "Running raw ingest");

        let collector = OutcomeCollector::default();
        let result = self
            .catalog
            .run_raw_ingest(paths, transfer, &collector)
            .await;
        let mut outcome = collector.outcome.into_inner();

        if let Err(e) = result {
            let cause = extract_cause(&e);
            warn!(files = paths.len(), cause = %cause, "Raw ingest task failed");
            for path in paths {
                if !outcome.succeeded_for(path) && outcome.failure_for(path).is_none() {
                    outcome.failed.push((path.clone(), cause.clone()));
                }
            }
        }

        IngestStats::add(&self.stats.files_ingested, outcome.succeeded.len());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;

    fn paths(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_outcome_per_file() {
        let catalog = Arc::new(MemoryCatalog::new("/repo").with_instrument("LsstCam"));
        catalog.mark_unreadable("/data/bad.fits");
        let stats = Arc::new(IngestStats::default());
        let raw = RawFallback::new(catalog.clone(), stats.clone());

        let outcome = raw
            .run_raw(&paths(&["/data/a.fits", "/data/bad.fits"]), TransferMode::Direct)
            .await;

        assert_eq!(outcome.succeeded, vec!["/data/a.fits"]);
        assert!(outcome.failure_for("/data/bad.fits").is_some());
        assert!(catalog.contains_path("/data/a.fits"));
        assert_eq!(stats.snapshot().raw_fallbacks, 1);
        assert_eq!(stats.snapshot().files_ingested, 1);
    }

    #[tokio::test]
    async fn test_task_error_fails_every_path() {
        // No instrument configured, so the task cannot start.
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        let raw = RawFallback::new(catalog, Arc::new(IngestStats::default()));

        let outcome = raw
            .run_raw(&paths(&["/data/a.fits", "/data/b.fits"]), TransferMode::Direct)
            .await;

        assert!(outcome.succeeded.is_empty());
        assert_eq!(outcome.failed.len(), 2);
        assert!(outcome.failure_for("/data/b.fits").unwrap().contains("instrument"));
    }

    #[tokio::test]
    async fn test_empty_input_skips_task() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        let raw = RawFallback::new(catalog.clone(), Arc::new(IngestStats::default()));

        let outcome = raw.run_raw(&[], TransferMode::Direct).await;

        assert_eq!(outcome, RawIngestOutcome::default());
        assert_eq!(catalog.raw_ingest_calls(), 0);
    }
}
