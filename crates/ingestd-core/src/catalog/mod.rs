//! Butler catalog client abstraction.
//!
//! The ingest engine only talks to the catalog through the [`Catalog`]
//! trait. Two implementations are provided:
//!
//! - [`RestCatalogClient`]: a Butler server reached over HTTP
//! - [`MemoryCatalog`]: an in-process registry for dry runs and tests
//!
//! Implementations are created from configuration by the
//! [`CatalogFactoryRegistry`].

mod factory;
mod memory;
mod rest;
pub mod rest_api;
mod types;

pub use factory::{CatalogFactory, CatalogFactoryRegistry, MemoryCatalogFactory, RestCatalogFactory};
pub use memory::MemoryCatalog;
pub use rest::RestCatalogClient;
pub use types::{
    DataIdSpec, DatasetRef, DatasetType, DatasetTypeSpec, FileDataset, SerializedDatasetRef,
    TransferMode,
};

use crate::config::CatalogType;
use crate::CatalogError;
use async_trait::async_trait;
use uuid::Uuid;

/// Result type for catalog calls.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Operations the daemon needs from a Butler repository.
///
/// Bulk registration is not assumed to be atomic: a failed call may leave
/// some of the datasets registered.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Check if the catalog is reachable.
    async fn health_check(&self) -> CatalogResult<CatalogHealth>;

    /// Register every dataset in `datasets` in a single call.
    async fn bulk_register(
        &self,
        datasets: &[FileDataset],
        transfer: TransferMode,
    ) -> CatalogResult<()>;

    /// Register a dataset type. Returns `false` if it was already registered.
    async fn register_dataset_type(&self, dataset_type: &DatasetType) -> CatalogResult<bool>;

    /// Register a run collection. Returns `false` if it already existed.
    async fn register_run(&self, run: &str) -> CatalogResult<bool>;

    /// Look up a dataset by ID.
    async fn get_dataset(&self, id: Uuid) -> CatalogResult<Option<DatasetRef>>;

    /// Look up a registered dataset type by name.
    async fn get_dataset_type(&self, name: &str) -> CatalogResult<Option<DatasetType>>;

    /// Run the raw-exposure ingest task over `paths`.
    ///
    /// Metadata is extracted from file content. Per-file outcomes are reported
    /// through `observer`; an `Err` means the task itself could not run.
    async fn run_raw_ingest(
        &self,
        paths: &[String],
        transfer: TransferMode,
        observer: &dyn RawIngestObserver,
    ) -> CatalogResult<()>;

    /// Import dimension records from an exported YAML file.
    async fn import_dimension_file(&self, path: &str) -> CatalogResult<()>;

    /// Ingest a zip archive of datasets with an embedded index.
    async fn ingest_archive(&self, path: &str, transfer: TransferMode) -> CatalogResult<()>;

    /// Get the catalog type.
    fn catalog_type(&self) -> CatalogType;

    /// Repository this catalog is bound to.
    fn repo(&self) -> &str;
}

/// Callbacks invoked by the raw-ingest task.
pub trait RawIngestObserver: Send + Sync {
    /// Files ingested, one entry per stored file.
    fn on_success(&self, datasets: &[FileDataset]);

    /// A group of files belonging to one exposure failed to ingest.
    fn on_ingest_failure(&self, files: &[String], error: &CatalogError);

    /// Metadata could not be extracted from one file.
    fn on_metadata_failure(&self, path: &str, error: &CatalogError);
}

/// Health status of a catalog connection.
#[derive(Debug, Clone)]
pub struct CatalogHealth {
    /// Whether the catalog is healthy
    pub is_healthy: bool,
    /// Response time in milliseconds
    pub response_time_ms: u64,
    /// Optional message with details
    pub message: Option<String>,
    /// Catalog type
    pub catalog_type: CatalogType,
}
