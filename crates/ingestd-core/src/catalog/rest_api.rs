//! Wire types for the Butler REST protocol.
//!
//! Endpoints (all JSON):
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | GET  | `/v1/health` | |
//! | POST | `/v1/datasets/ingest` | [`BulkIngestRequest`] |
//! | GET  | `/v1/datasets/{id}` | |
//! | POST | `/v1/dataset-types` | [`DatasetType`] |
//! | GET  | `/v1/dataset-types/{name}` | |
//! | POST | `/v1/runs` | [`RegisterRunRequest`] |
//! | POST | `/v1/raw/ingest` | [`RawIngestRequest`] |
//! | POST | `/v1/dimensions/import` | [`PathRequest`] |
//! | POST | `/v1/archives/ingest` | [`ArchiveIngestRequest`] |
//!
//! Errors come back as [`ErrorResponse`] bodies.

use super::{DatasetType, FileDataset, TransferMode};
use serde::{Deserialize, Serialize};

/// Health endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status string
    pub status: String,
    /// Server version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Bulk ingest request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkIngestRequest {
    /// Datasets to register
    pub datasets: Vec<FileDataset>,
    /// Transfer mode
    pub transfer: TransferMode,
}

/// Dataset type or run registration response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Whether the object was newly created
    pub created: bool,
}

/// Register run request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunRequest {
    /// Run collection name
    pub name: String,
}

/// Raw ingest request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIngestRequest {
    /// Files to ingest
    pub files: Vec<String>,
    /// Transfer mode
    pub transfer: TransferMode,
}

/// Stage at which a raw file failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawFailureStage {
    /// Header metadata could not be extracted
    Metadata,
    /// Registration or transfer failed
    Ingest,
}

/// One failed group of raw files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIngestFailure {
    /// Files in the failed group
    pub files: Vec<String>,
    /// Failing stage
    pub stage: RawFailureStage,
    /// Error reported by the server
    pub error: ErrorResponse,
}

/// Raw ingest response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawIngestResponse {
    /// Files ingested
    #[serde(default)]
    pub succeeded: Vec<FileDataset>,
    /// Per-group failures
    #[serde(default)]
    pub failures: Vec<RawIngestFailure>,
}

/// Request naming a single file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    /// File location
    pub path: String,
}

/// Archive ingest request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveIngestRequest {
    /// Archive location
    pub path: String,
    /// Transfer mode
    pub transfer: TransferMode,
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error class name, e.g. `MissingDatasetTypeError`
    #[serde(rename = "type")]
    pub error_type: String,
    /// HTTP status code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Dataset type name, for dataset type errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Run name, for collection errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    /// File path, for I/O errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Underlying error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorResponse>>,
}

/// Dataset type request body; the registry takes the full definition.
pub type RegisterDatasetTypeRequest = DatasetType;
