//! Units of ingest work built from messages.

mod factory;

pub use factory::EntryFactory;

use crate::catalog::FileDataset;
use crate::EntryError;
use serde_json::Value;
use std::fmt;

/// Kind of file announced by a message, from its `rubin_butler` flag.
///
/// `Ord` follows the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataKind {
    /// Raw exposure; metadata comes from the file itself
    RawFile = 1,
    /// Data product with a sidecar dataset reference
    DataProduct = 2,
    /// Zip archive of data products
    ZipBundle = 3,
    /// Exported dimension records
    DimensionFile = 4,
}

impl DataKind {
    /// Every kind, in wire order.
    pub const ALL: [DataKind; 4] = [
        DataKind::RawFile,
        DataKind::DataProduct,
        DataKind::ZipBundle,
        DataKind::DimensionFile,
    ];

    /// Wire value.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Parse a `rubin_butler` flag, given as a number or a numeric string.
    pub fn from_flag(flag: &Value) -> Result<Self, EntryError> {
        let code = match flag {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        code.and_then(|c| DataKind::try_from(c).ok())
            .ok_or_else(|| EntryError::UnknownKind(flag.to_string()))
    }
}

impl TryFrom<i64> for DataKind {
    type Error = EntryError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        DataKind::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or_else(|| EntryError::UnknownKind(code.to_string()))
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataKind::RawFile => "raw",
            DataKind::DataProduct => "data-product",
            DataKind::ZipBundle => "zip",
            DataKind::DimensionFile => "dimension",
        };
        f.write_str(name)
    }
}

/// What is handed to the catalog for an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    /// File plus resolved dataset reference
    Dataset(FileDataset),
    /// Bare file location
    Path(String),
}

/// One pending unit of ingest work, already rewritten to a local location.
#[derive(Debug, Clone)]
pub struct Entry {
    kind: DataKind,
    source_url: String,
    file_to_ingest: String,
    sidecar: Option<Value>,
    payload: EntryPayload,
}

impl Entry {
    /// Create an entry carrying a bare path.
    pub fn with_path(
        kind: DataKind,
        source_url: impl Into<String>,
        file_to_ingest: impl Into<String>,
        sidecar: Option<Value>,
    ) -> Self {
        let file_to_ingest = file_to_ingest.into();
        Self {
            kind,
            source_url: source_url.into(),
            payload: EntryPayload::Path(file_to_ingest.clone()),
            file_to_ingest,
            sidecar,
        }
    }

    /// Create a data product entry.
    pub fn with_dataset(
        source_url: impl Into<String>,
        dataset: FileDataset,
        sidecar: Value,
    ) -> Self {
        Self {
            kind: DataKind::DataProduct,
            source_url: source_url.into(),
            file_to_ingest: dataset.path.clone(),
            sidecar: Some(sidecar),
            payload: EntryPayload::Dataset(dataset),
        }
    }

    /// Data kind.
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// URL as announced by Rucio.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Local location of the file.
    pub fn file_to_ingest(&self) -> &str {
        &self.file_to_ingest
    }

    /// Sidecar metadata, if the message carried any.
    pub fn sidecar(&self) -> Option<&Value> {
        self.sidecar.as_ref()
    }

    /// Catalog-facing payload.
    pub fn payload(&self) -> &EntryPayload {
        &self.payload
    }

    /// The dataset, for data products.
    pub fn dataset(&self) -> Option<&FileDataset> {
        match &self.payload {
            EntryPayload::Dataset(dataset) => Some(dataset),
            EntryPayload::Path(_) => None,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.file_to_ingest)
    }
}
