//! Catalog ingest for a batch of entries.
//!
//! Entries are grouped by [`DataKind`] and each group goes to its own
//! path:
//!
//! - dimension files are imported one by one
//! - raw files go to the raw ingest task
//! - data products go through the [`BulkIngestEngine`]
//! - zip bundles are ingested one archive at a time

mod engine;
mod grouper;
mod isolator;
mod raw;
mod repair;
mod stats;

pub use engine::{BatchReport, BulkIngestEngine};
pub use grouper::group_by_kind;
pub use isolator::Isolator;
pub use raw::{RawFallback, RawIngestOutcome};
pub use stats::{IngestStats, IngestStatsSnapshot};

use crate::catalog::{Catalog, FileDataset, TransferMode};
use crate::config::ButlerConfig;
use crate::entries::{DataKind, Entry};
use crate::error::extract_cause;
use crate::IsolationFailure;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument, Span};

/// Order in which kinds are handed to the catalog.
///
/// Dimension records go first so data products in the same batch can refer
/// to them.
pub const DISPATCH_ORDER: [DataKind; 4] = [
    DataKind::DimensionFile,
    DataKind::RawFile,
    DataKind::DataProduct,
    DataKind::ZipBundle,
];

/// Transfer mode per ingest path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub data_product: TransferMode,
    pub raw: TransferMode,
    pub archive: TransferMode,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            data_product: TransferMode::Auto,
            raw: TransferMode::Direct,
            archive: TransferMode::Auto,
        }
    }
}

impl From<&ButlerConfig> for TransferSettings {
    fn from(config: &ButlerConfig) -> Self {
        Self {
            data_product: config.data_product_transfer,
            raw: config.raw_transfer,
            archive: config.archive_transfer,
        }
    }
}

/// What happened to one batch of entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Kinds in the order they were dispatched
    pub dispatched: Vec<DataKind>,
    /// Locations confirmed ingested
    pub ingested: Vec<String>,
    /// Locations that could not be ingested
    pub failures: Vec<IsolationFailure>,
}

impl IngestReport {
    fn absorb(&mut self, batch: BatchReport) {
        if let Some(mut outcome) = batch.raw_fallback {
            // The raw task sees the whole batch, including datasets the bulk
            // path had already confirmed.
            outcome.succeeded.retain(|path| !batch.ingested.contains(path));
            outcome
                .failed
                .retain(|(path, _)| !batch.ingested.contains(path));
            self.ingested.extend(batch.ingested);
            self.failures.extend(batch.failures);
            self.absorb_raw(outcome);
        } else {
            self.ingested.extend(batch.ingested);
            self.failures.extend(batch.failures);
        }
    }

    fn absorb_raw(&mut self, outcome: RawIngestOutcome) {
        self.ingested.extend(outcome.succeeded);
        self.failures.extend(
            outcome
                .failed
                .into_iter()
                .map(|(path, cause)| IsolationFailure::new(path, cause)),
        );
    }
}

/// Dispatches entries to the catalog by kind.
pub struct Ingester {
    catalog: Arc<dyn Catalog>,
    engine: BulkIngestEngine,
    raw: RawFallback,
    transfers: TransferSettings,
    stats: Arc<IngestStats>,
    span: Span,
}

impl Ingester {
    /// Create an ingester over `catalog`.
    pub fn new(catalog: Arc<dyn Catalog>, transfers: TransferSettings) -> Self {
        let stats = Arc::new(IngestStats::default());
        Self {
            engine: BulkIngestEngine::new(catalog.clone(), stats.clone()),
            raw: RawFallback::new(catalog.clone(), stats.clone()),
            catalog,
            transfers,
            stats,
            span: tracing::info_span!("ingest"),
        }
    }

    /// Log through `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Counters across every batch handled so far.
    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Ingest `entries`, one kind at a time in [`DISPATCH_ORDER`].
    ///
    /// Per-file failures are collected in the report; nothing here aborts
    /// the batch.
    pub async fn ingest(&self, entries: Vec<Entry>) -> IngestReport {
        self.dispatch(entries).instrument(self.span.clone()).await
    }

    async fn dispatch(&self, entries: Vec<Entry>) -> IngestReport {
        let mut report = IngestReport::default();
        let mut groups = group_by_kind(entries);

        for kind in DISPATCH_ORDER {
            let Some(group) = groups.remove(&kind) else {
                continue;
            };
            debug!(%kind, entries = group.len(), "Dispatching");
            report.dispatched.push(kind);

            match kind {
                DataKind::DimensionFile => self.import_dimensions(&group, &mut report).await,
                DataKind::RawFile => {
                    let paths: Vec<String> =
                        group.iter().map(|e| e.file_to_ingest().to_string()).collect();
                    let outcome = self.raw.run_raw(&paths, self.transfers.raw).await;
                    report.absorb_raw(outcome);
                }
                DataKind::DataProduct => {
                    let datasets: Vec<FileDataset> =
                        group.iter().filter_map(|e| e.dataset().cloned()).collect();
                    let batch = self
                        .engine
                        .ingest_batch(&datasets, self.transfers.data_product, false)
                        .await;
                    report.absorb(batch);
                }
                DataKind::ZipBundle => self.ingest_archives(&group, &mut report).await,
            }
        }

        if report.failures.is_empty() {
            info!(ingested = report.ingested.len(), "Ingest finished");
        } else {
            warn!(
                ingested = report.ingested.len(),
                failed = report.failures.len(),
                "Ingest finished with failures"
            );
        }
        report
    }

    async fn import_dimensions(&self, group: &[Entry], report: &mut IngestReport) {
        for entry in group {
            let path = entry.file_to_ingest();
            match self.catalog.import_dimension_file(path).await {
                Ok(()) => {
                    info!(path = %path, "Dimension records imported");
                    IngestStats::incr(&self.stats.files_ingested);
                    report.ingested.push(path.to_string());
                }
                Err(e) => {
                    let cause = extract_cause(&e);
                    warn!(path = %path, cause = %cause, "Dimension import failed");
                    report.failures.push(IsolationFailure::new(path, cause));
                }
            }
        }
    }

    async fn ingest_archives(&self, group: &[Entry], report: &mut IngestReport) {
        for entry in group {
            let path = entry.file_to_ingest();
            match self
                .catalog
                .ingest_archive(path, self.transfers.archive)
                .await
            {
                Ok(()) => {
                    info!(path = %path, "Archive ingested");
                    IngestStats::incr(&self.stats.files_ingested);
                    report.ingested.push(path.to_string());
                }
                Err(e) => {
                    let cause = extract_cause(&e);
                    warn!(path = %path, cause = %cause, "Archive ingest failed");
                    report.failures.push(IsolationFailure::new(path, cause));
                }
            }
        }
    }
}
