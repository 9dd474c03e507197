//! In-place repair of missing dataset types and runs.

use super::IngestStats;
use crate::catalog::{Catalog, FileDataset};
use crate::CatalogError;
use std::collections::HashSet;
use tracing::{debug, info};

/// Result of one repair pass.
#[derive(Debug)]
pub(crate) enum RepairOutcome {
    /// Something new was registered; retry the same datasets
    Repaired,
    /// Not a schema error, or everything it names was already repaired
    Exhausted,
    /// Registration itself failed
    Failed(CatalogError),
}

/// Tracks what one engine or isolator invocation has registered.
///
/// Each dataset type and run is registered at most once per invocation,
/// so a catalog that keeps reporting the same schema error cannot keep the
/// caller looping.
#[derive(Debug, Default)]
pub(crate) struct SchemaRepair {
    dataset_types: HashSet<String>,
    runs: HashSet<String>,
}

impl SchemaRepair {
    /// Register the dataset types or runs referenced by `pending` that
    /// `error` says are missing.
    pub(crate) async fn repair(
        &mut self,
        catalog: &dyn Catalog,
        stats: &IngestStats,
        error: &CatalogError,
        pending: &[FileDataset],
    ) -> RepairOutcome {
        match error {
            CatalogError::MissingDatasetType { name } => {
                info!(dataset_type = %name, "Registering dataset types");
                self.register_dataset_types(catalog, stats, pending).await
            }
            CatalogError::MissingCollection { run } => {
                info!(run = %run, "Registering runs");
                self.register_runs(catalog, stats, pending).await
            }
            _ => RepairOutcome::Exhausted,
        }
    }

    async fn register_dataset_types(
        &mut self,
        catalog: &dyn Catalog,
        stats: &IngestStats,
        pending: &[FileDataset],
    ) -> RepairOutcome {
        let mut progressed = false;
        for dataset_type in pending.iter().flat_map(|d| d.dataset_types()) {
            if self.dataset_types.contains(&dataset_type.name) {
                continue;
            }
            match catalog.register_dataset_type(dataset_type).await {
                Ok(created) => {
                    debug!(dataset_type = %dataset_type.name, created, "Dataset type registered");
                    self.dataset_types.insert(dataset_type.name.clone());
                    IngestStats::incr(&stats.dataset_type_repairs);
                    progressed = true;
                }
                Err(e) => return RepairOutcome::Failed(e),
            }
        }
        Self::outcome(progressed)
    }

    async fn register_runs(
        &mut self,
        catalog: &dyn Catalog,
        stats: &IngestStats,
        pending: &[FileDataset],
    ) -> RepairOutcome {
        let mut progressed = false;
        for run in pending.iter().flat_map(|d| d.runs()) {
            if self.runs.contains(run) {
                continue;
            }
            match catalog.register_run(run).await {
                Ok(created) => {
                    debug!(run = %run, created, "Run registered");
                    self.runs.insert(run.to_string());
                    IngestStats::incr(&stats.run_repairs);
                    progressed = true;
                }
                Err(e) => return RepairOutcome::Failed(e),
            }
        }
        Self::outcome(progressed)
    }

    fn outcome(progressed: bool) -> RepairOutcome {
        if progressed {
            RepairOutcome::Repaired
        } else {
            RepairOutcome::Exhausted
        }
    }
}
