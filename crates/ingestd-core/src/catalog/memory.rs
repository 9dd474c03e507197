//! In-process catalog.
//!
//! Keeps dataset types, runs and datasets in memory. Bulk registration
//! checks schema first and then commits datasets one at a time, so a failure
//! part-way through leaves the earlier datasets registered, the way a
//! non-transactional datastore ingest does.

use super::{
    Catalog, CatalogHealth, CatalogResult, DatasetRef, DatasetType, FileDataset,
    RawIngestObserver, TransferMode,
};
use crate::config::CatalogType;
use crate::CatalogError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// Dataset type name used for raw exposures.
pub const RAW_DATASET_TYPE: &str = "raw";

/// A registered dataset.
#[derive(Debug, Clone)]
pub struct StoredDataset {
    /// Reference as registered
    pub dataset_ref: DatasetRef,
    /// File holding the dataset
    pub path: String,
    /// Transfer mode used
    pub transfer: TransferMode,
    /// When the dataset was registered
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    dataset_types: HashMap<String, DatasetType>,
    runs: BTreeSet<String>,
    datasets: HashMap<Uuid, StoredDataset>,
    raw_paths: HashSet<String>,
    dimension_files: Vec<String>,
    archives: Vec<String>,
    unreadable: HashSet<String>,
    bulk_failure: Option<String>,
    unhealthy: bool,
}

#[derive(Default)]
struct Counters {
    bulk_calls: AtomicU64,
    dataset_type_registrations: AtomicU64,
    run_registrations: AtomicU64,
    lookups: AtomicU64,
    raw_ingest_calls: AtomicU64,
}

/// In-memory Butler registry.
pub struct MemoryCatalog {
    repo: String,
    instrument: Option<String>,
    atomic_bulk: bool,
    state: RwLock<MemoryState>,
    counters: Counters,
}

impl MemoryCatalog {
    /// Create an empty catalog for `repo`.
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            instrument: None,
            atomic_bulk: false,
            state: RwLock::new(MemoryState::default()),
            counters: Counters::default(),
        }
    }

    /// Set the instrument used to name raw runs.
    pub fn with_instrument(mut self, instrument: impl Into<String>) -> Self {
        self.instrument = Some(instrument.into());
        self
    }

    /// Roll back the whole bulk call on failure instead of keeping the
    /// datasets committed before the failing one.
    pub fn with_atomic_bulk(mut self, atomic: bool) -> Self {
        self.atomic_bulk = atomic;
        self
    }

    /// Make every later read of `path` fail.
    pub fn mark_unreadable(&self, path: impl Into<String>) {
        self.state.write().unreadable.insert(path.into());
    }

    /// Reject every bulk call with `message` until cleared.
    pub fn fail_bulk_calls(&self, message: Option<String>) {
        self.state.write().bulk_failure = message;
    }

    /// Make the health check report the catalog as down, or back up.
    pub fn set_healthy(&self, healthy: bool) {
        self.state.write().unhealthy = !healthy;
    }

    /// Pre-register a dataset type.
    pub fn add_dataset_type(&self, dataset_type: DatasetType) {
        self.state
            .write()
            .dataset_types
            .insert(dataset_type.name.clone(), dataset_type);
    }

    /// Pre-register a run.
    pub fn add_run(&self, run: impl Into<String>) {
        self.state.write().runs.insert(run.into());
    }

    /// Whether a dataset type is registered.
    pub fn has_dataset_type(&self, name: &str) -> bool {
        self.state.read().dataset_types.contains_key(name)
    }

    /// Whether a run is registered.
    pub fn has_run(&self, run: &str) -> bool {
        self.state.read().runs.contains(run)
    }

    /// Whether a dataset is registered.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.state.read().datasets.contains_key(id)
    }

    /// Whether any dataset is stored in `path`.
    pub fn contains_path(&self, path: &str) -> bool {
        self.state.read().datasets.values().any(|d| d.path == path)
    }

    /// Look up a registered dataset.
    pub fn stored(&self, id: &Uuid) -> Option<StoredDataset> {
        self.state.read().datasets.get(id).cloned()
    }

    /// Number of registered datasets.
    pub fn dataset_count(&self) -> usize {
        self.state.read().datasets.len()
    }

    /// Dimension files imported so far, in order.
    pub fn dimension_files(&self) -> Vec<String> {
        self.state.read().dimension_files.clone()
    }

    /// Archives ingested so far, in order.
    pub fn archives(&self) -> Vec<String> {
        self.state.read().archives.clone()
    }

    /// Number of bulk register calls.
    pub fn bulk_calls(&self) -> u64 {
        self.counters.bulk_calls.load(Ordering::Relaxed)
    }

    /// Number of dataset type registrations that created a new type.
    pub fn dataset_type_registrations(&self) -> u64 {
        self.counters
            .dataset_type_registrations
            .load(Ordering::Relaxed)
    }

    /// Number of run registrations that created a new run.
    pub fn run_registrations(&self) -> u64 {
        self.counters.run_registrations.load(Ordering::Relaxed)
    }

    /// Number of dataset lookups.
    pub fn lookups(&self) -> u64 {
        self.counters.lookups.load(Ordering::Relaxed)
    }

    /// Number of raw ingest task runs.
    pub fn raw_ingest_calls(&self) -> u64 {
        self.counters.raw_ingest_calls.load(Ordering::Relaxed)
    }

    fn check_readable(state: &MemoryState, path: &str) -> CatalogResult<()> {
        if state.unreadable.contains(path) {
            return Err(CatalogError::FileUnreadable {
                path: path.to_string(),
                message: "file is truncated or missing".into(),
            });
        }
        Ok(())
    }

    fn check_schema(state: &MemoryState, datasets: &[FileDataset]) -> CatalogResult<()> {
        for dataset_type in datasets.iter().flat_map(|d| d.dataset_types()) {
            match state.dataset_types.get(&dataset_type.name) {
                None => {
                    return Err(CatalogError::MissingDatasetType {
                        name: dataset_type.name.clone(),
                    })
                }
                Some(existing) if existing != dataset_type => {
                    return Err(CatalogError::ConflictingDefinition(format!(
                        "dataset type {} is registered with storage class {}",
                        existing.name, existing.storage_class
                    )))
                }
                Some(_) => {}
            }
        }

        for run in datasets.iter().flat_map(|d| d.runs()) {
            if !state.runs.contains(run) {
                return Err(CatalogError::MissingCollection {
                    run: run.to_string(),
                });
            }
        }

        Ok(())
    }

    fn commit(
        state: &mut MemoryState,
        dataset: &FileDataset,
        transfer: TransferMode,
    ) -> CatalogResult<Vec<Uuid>> {
        Self::check_readable(state, &dataset.path)?;

        for dataset_ref in &dataset.refs {
            if state.datasets.contains_key(&dataset_ref.id) {
                return Err(CatalogError::ConflictingDefinition(format!(
                    "dataset {} already registered",
                    dataset_ref.id
                )));
            }
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(dataset.refs.len());
        for dataset_ref in &dataset.refs {
            state.datasets.insert(
                dataset_ref.id,
                StoredDataset {
                    dataset_ref: dataset_ref.clone(),
                    path: dataset.path.clone(),
                    transfer,
                    registered_at: now,
                },
            );
            ids.push(dataset_ref.id);
        }
        Ok(ids)
    }

    /// Short instrument name from a fully qualified class name.
    fn instrument_name(&self) -> Option<&str> {
        self.instrument
            .as_deref()
            .map(|class| class.rsplit('.').next().unwrap_or(class))
    }

    fn raw_dataset_type() -> DatasetType {
        DatasetType {
            name: RAW_DATASET_TYPE.into(),
            storage_class: "Exposure".into(),
            dimensions: vec!["instrument".into(), "exposure".into(), "detector".into()],
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn health_check(&self) -> CatalogResult<CatalogHealth> {
        Ok(CatalogHealth {
            is_healthy: !self.state.read().unhealthy,
            response_time_ms: 0,
            message: Some(format!("In-memory catalog for {}", self.repo)),
            catalog_type: CatalogType::Memory,
        })
    }

    async fn bulk_register(
        &self,
        datasets: &[FileDataset],
        transfer: TransferMode,
    ) -> CatalogResult<()> {
        self.counters.bulk_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write();

        if let Some(message) = &state.bulk_failure {
            return Err(CatalogError::other(message.clone()));
        }

        Self::check_schema(&state, datasets)?;

        let mut committed = Vec::new();
        for dataset in datasets {
            match Self::commit(&mut state, dataset, transfer) {
                Ok(ids) => committed.extend(ids),
                Err(e) => {
                    if self.atomic_bulk {
                        for id in &committed {
                            state.datasets.remove(id);
                        }
                    }
                    return Err(CatalogError::caused_by(
                        format!("Failed to ingest {}", dataset.path),
                        e,
                    ));
                }
            }
        }

        debug!(datasets = datasets.len(), %transfer, "Bulk registration committed");
        Ok(())
    }

    async fn register_dataset_type(&self, dataset_type: &DatasetType) -> CatalogResult<bool> {
        let mut state = self.state.write();
        match state.dataset_types.get(&dataset_type.name) {
            Some(existing) if existing == dataset_type => Ok(false),
            Some(existing) => Err(CatalogError::ConflictingDefinition(format!(
                "dataset type {} is registered with storage class {}",
                existing.name, existing.storage_class
            ))),
            None => {
                state
                    .dataset_types
                    .insert(dataset_type.name.clone(), dataset_type.clone());
                self.counters
                    .dataset_type_registrations
                    .fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
        }
    }

    async fn register_run(&self, run: &str) -> CatalogResult<bool> {
        let inserted = self.state.write().runs.insert(run.to_string());
        if inserted {
            self.counters.run_registrations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(inserted)
    }

    async fn get_dataset(&self, id: Uuid) -> CatalogResult<Option<DatasetRef>> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .state
            .read()
            .datasets
            .get(&id)
            .map(|d| d.dataset_ref.clone()))
    }

    async fn get_dataset_type(&self, name: &str) -> CatalogResult<Option<DatasetType>> {
        Ok(self.state.read().dataset_types.get(name).cloned())
    }

    async fn run_raw_ingest(
        &self,
        paths: &[String],
        transfer: TransferMode,
        observer: &dyn RawIngestObserver,
    ) -> CatalogResult<()> {
        self.counters.raw_ingest_calls.fetch_add(1, Ordering::Relaxed);

        let instrument = self
            .instrument_name()
            .ok_or_else(|| CatalogError::other("raw ingest requires an instrument"))?
            .to_string();
        let run = format!("{}/raw/all", instrument);
        let raw_type = Self::raw_dataset_type();

        let mut ingested = Vec::new();
        {
            let mut state = self.state.write();
            state
                .dataset_types
                .entry(raw_type.name.clone())
                .or_insert_with(|| raw_type.clone());
            state.runs.insert(run.clone());

            for path in paths {
                if let Err(e) = Self::check_readable(&state, path) {
                    observer.on_metadata_failure(path, &e);
                    continue;
                }
                if !state.raw_paths.insert(path.clone()) {
                    let error = CatalogError::ConflictingDefinition(format!(
                        "raw file {} already ingested",
                        path
                    ));
                    observer.on_ingest_failure(std::slice::from_ref(path), &error);
                    continue;
                }

                let mut data_id = BTreeMap::new();
                data_id.insert("instrument".to_string(), Value::from(instrument.clone()));
                let dataset = FileDataset::new(
                    path.clone(),
                    DatasetRef {
                        id: Uuid::new_v4(),
                        dataset_type: raw_type.clone(),
                        data_id,
                        run: run.clone(),
                    },
                );
                Self::commit(&mut state, &dataset, transfer)?;
                ingested.push(dataset);
            }
        }

        if !ingested.is_empty() {
            observer.on_success(&ingested);
        }
        Ok(())
    }

    async fn import_dimension_file(&self, path: &str) -> CatalogResult<()> {
        let mut state = self.state.write();
        Self::check_readable(&state, path)?;
        state.dimension_files.push(path.to_string());
        info!(path = %path, "Dimension records imported");
        Ok(())
    }

    async fn ingest_archive(&self, path: &str, transfer: TransferMode) -> CatalogResult<()> {
        let mut state = self.state.write();
        Self::check_readable(&state, path)?;
        state.archives.push(path.to_string());
        info!(path = %path, %transfer, "Archive ingested");
        Ok(())
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Memory
    }

    fn repo(&self) -> &str {
        &self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn calexp(path: &str, run: &str) -> FileDataset {
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
                run: run.into(),
            },
        )
    }

    #[derive(Default)]
    struct Recorder {
        succeeded: Mutex<Vec<String>>,
        metadata_failures: Mutex<Vec<String>>,
        ingest_failures: Mutex<Vec<String>>,
    }

    impl RawIngestObserver for Recorder {
        fn on_success(&self, datasets: &[FileDataset]) {
            self.succeeded
                .lock()
                .extend(datasets.iter().map(|d| d.path.clone()));
        }

        fn on_ingest_failure(&self, files: &[String], _error: &CatalogError) {
            self.ingest_failures.lock().extend(files.iter().cloned());
        }

        fn on_metadata_failure(&self, path: &str, _error: &CatalogError) {
            self.metadata_failures.lock().push(path.to_string());
        }
    }

    #[tokio::test]
    async fn test_bulk_requires_dataset_type_then_run() {
        let catalog = MemoryCatalog::new("/repo");
        let dataset = calexp("/data/a.fits", "run/a");

        let err = catalog
            .bulk_register(&[dataset.clone()], TransferMode::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::MissingDatasetType { ref name } if name == "calexp"));

        catalog
            .register_dataset_type(&dataset.refs[0].dataset_type)
            .await
            .unwrap();
        let err = catalog
            .bulk_register(&[dataset.clone()], TransferMode::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::MissingCollection { ref run } if run == "run/a"));

        catalog.register_run("run/a").await.unwrap();
        catalog
            .bulk_register(&[dataset.clone()], TransferMode::Auto)
            .await
            .unwrap();

        assert!(catalog.contains(&dataset.refs[0].id));
        assert_eq!(catalog.bulk_calls(), 3);
    }

    #[tokio::test]
    async fn test_partial_commit_on_unreadable_file() {
        let catalog = MemoryCatalog::new("/repo");
        let good = calexp("/data/good.fits", "run/a");
        let bad = calexp("/data/bad.fits", "run/a");
        catalog.add_dataset_type(good.refs[0].dataset_type.clone());
        catalog.add_run("run/a");
        catalog.mark_unreadable("/data/bad.fits");

        let err = catalog
            .bulk_register(&[good.clone(), bad.clone()], TransferMode::Auto)
            .await
            .unwrap_err();

        assert!(crate::error::extract_cause(&err).contains("/data/bad.fits"));
        assert!(catalog.contains(&good.refs[0].id));
        assert!(!catalog.contains(&bad.refs[0].id));
    }

    #[tokio::test]
    async fn test_atomic_bulk_rolls_back() {
        let catalog = MemoryCatalog::new("/repo").with_atomic_bulk(true);
        let good = calexp("/data/good.fits", "run/a");
        let bad = calexp("/data/bad.fits", "run/a");
        catalog.add_dataset_type(good.refs[0].dataset_type.clone());
        catalog.add_run("run/a");
        catalog.mark_unreadable("/data/bad.fits");

        assert!(catalog
            .bulk_register(&[good.clone(), bad], TransferMode::Auto)
            .await
            .is_err());
        assert_eq!(catalog.dataset_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let catalog = MemoryCatalog::new("/repo");
        let dataset = calexp("/data/a.fits", "run/a");
        catalog.add_dataset_type(dataset.refs[0].dataset_type.clone());
        catalog.add_run("run/a");

        catalog
            .bulk_register(&[dataset.clone()], TransferMode::Auto)
            .await
            .unwrap();
        let err = catalog
            .bulk_register(&[dataset], TransferMode::Auto)
            .await
            .unwrap_err();
        assert!(crate::error::extract_cause(&err).contains("already registered"));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let catalog = MemoryCatalog::new("/repo");
        let dataset = calexp("/data/a.fits", "run/a");
        let dataset_type = &dataset.refs[0].dataset_type;

        assert!(catalog.register_dataset_type(dataset_type).await.unwrap());
        assert!(!catalog.register_dataset_type(dataset_type).await.unwrap());
        assert!(catalog.register_run("run/a").await.unwrap());
        assert!(!catalog.register_run("run/a").await.unwrap());
        assert_eq!(catalog.dataset_type_registrations(), 1);
        assert_eq!(catalog.run_registrations(), 1);
    }

    #[tokio::test]
    async fn test_raw_ingest_reports_through_observer() {
        let catalog =
            MemoryCatalog::new("/repo").with_instrument("lsst.obs.subaru.HyperSuprimeCam");
        catalog.mark_unreadable("/raw/bad.fits");
        let recorder = Recorder::default();

        catalog
            .run_raw_ingest(
                &["/raw/good.fits".to_string(), "/raw/bad.fits".to_string()],
                TransferMode::Direct,
                &recorder,
            )
            .await
            .unwrap();

        assert_eq!(*recorder.succeeded.lock(), vec!["/raw/good.fits"]);
        assert_eq!(*recorder.metadata_failures.lock(), vec!["/raw/bad.fits"]);
        assert!(catalog.has_run("HyperSuprimeCam/raw/all"));
        assert!(catalog.has_dataset_type(RAW_DATASET_TYPE));

        // Second ingest of the same file fails per exposure
        catalog
            .run_raw_ingest(&["/raw/good.fits".to_string()], TransferMode::Direct, &recorder)
            .await
            .unwrap();
        assert_eq!(*recorder.ingest_failures.lock(), vec!["/raw/good.fits"]);
    }

    #[tokio::test]
    async fn test_raw_ingest_requires_instrument() {
        let catalog = MemoryCatalog::new("/repo");
        let recorder = Recorder::default();
        assert!(catalog
            .run_raw_ingest(&["/raw/a.fits".to_string()], TransferMode::Direct, &recorder)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_archive_and_dimension_import() {
        let catalog = MemoryCatalog::new("/repo");
        catalog.mark_unreadable("/data/bad.zip");

        catalog.import_dimension_file("/data/dims.yaml").await.unwrap();
        catalog
            .ingest_archive("/data/good.zip", TransferMode::Auto)
            .await
            .unwrap();
        assert!(catalog
            .ingest_archive("/data/bad.zip", TransferMode::Auto)
            .await
            .is_err());

        assert_eq!(catalog.dimension_files(), vec!["/data/dims.yaml"]);
        assert_eq!(catalog.archives(), vec!["/data/good.zip"]);
    }
}
