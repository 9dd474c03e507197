//! Catalog-facing data types: dataset types, references and file datasets.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// How the catalog should place a file into its datastore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Let the datastore decide
    #[default]
    Auto,
    /// Reference the file where it is, outside the datastore root
    Direct,
    /// Copy into the datastore
    Copy,
    /// Hard link, falling back to symlink
    Link,
    /// Symbolic link
    Symlink,
    /// Move into the datastore
    Move,
}

impl TransferMode {
    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Auto => "auto",
            TransferMode::Direct => "direct",
            TransferMode::Copy => "copy",
            TransferMode::Link => "link",
            TransferMode::Symlink => "symlink",
            TransferMode::Move => "move",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full definition of a dataset type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetType {
    /// Dataset type name
    pub name: String,

    /// Storage class used to read and write datasets of this type
    #[serde(rename = "storageClass")]
    pub storage_class: String,

    /// Dimension names identifying a dataset of this type
    #[serde(default)]
    pub dimensions: Vec<String>,
}

/// Resolved reference to a single dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef {
    /// Dataset ID
    pub id: Uuid,

    /// Dataset type
    #[serde(rename = "datasetType")]
    pub dataset_type: DatasetType,

    /// Data ID: dimension name to value
    #[serde(rename = "dataId")]
    pub data_id: BTreeMap<String, Value>,

    /// Run collection the dataset belongs to
    pub run: String,
}

/// A file plus the dataset references stored in it.
///
/// Several references can share one file (companion files).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDataset {
    /// Location of the file
    pub path: String,

    /// Datasets stored in the file
    pub refs: Vec<DatasetRef>,

    /// Formatter class, if the catalog should not infer it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatter: Option<String>,
}

impl FileDataset {
    /// Create a file dataset holding a single reference.
    pub fn new(path: impl Into<String>, dataset_ref: DatasetRef) -> Self {
        Self {
            path: path.into(),
            refs: vec![dataset_ref],
            formatter: None,
        }
    }

    /// Dataset type definitions referenced by this file, in order.
    pub fn dataset_types(&self) -> impl Iterator<Item = &DatasetType> {
        self.refs.iter().map(|r| &r.dataset_type)
    }

    /// Run names referenced by this file, in order.
    pub fn runs(&self) -> impl Iterator<Item = &str> {
        self.refs.iter().map(|r| r.run.as_str())
    }

    /// Dataset IDs referenced by this file.
    pub fn ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.refs.iter().map(|r| r.id)
    }
}

/// Sidecar form of a dataset type: a full definition or just a name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DatasetTypeSpec {
    /// Complete definition
    Full(DatasetType),
    /// Name to be resolved against the catalog's registry
    Name(String),
}

/// Sidecar form of a data ID: either flat or nested one level under `dataId`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DataIdSpec {
    /// `{"dataId": {...}}`, as written by expanded data coordinates
    Nested {
        #[serde(rename = "dataId")]
        data_id: BTreeMap<String, Value>,
    },
    /// Plain mapping
    Flat(BTreeMap<String, Value>),
}

impl DataIdSpec {
    /// The underlying dimension mapping.
    pub fn into_map(self) -> BTreeMap<String, Value> {
        match self {
            DataIdSpec::Nested { data_id } => data_id,
            DataIdSpec::Flat(data_id) => data_id,
        }
    }
}

/// Serialized dataset reference as carried in a message sidecar.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SerializedDatasetRef {
    /// Dataset ID
    pub id: Uuid,

    /// Dataset type (full or by name)
    #[serde(rename = "datasetType")]
    pub dataset_type: DatasetTypeSpec,

    /// Data ID
    #[serde(rename = "dataId")]
    pub data_id: DataIdSpec,

    /// Run collection
    pub run: String,
}
