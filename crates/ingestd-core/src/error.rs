//! Error types for the ingest daemon.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Per-message failures ([`EntryError`], [`KafkaError::MessageParse`]) and
//! per-dataset failures ([`IsolationFailure`]) are logged and skipped by the
//! daemon; only startup configuration errors are fatal.

use thiserror::Error;

/// Result type alias for ingestd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of causes followed by [`extract_cause`].
pub const MAX_CAUSE_DEPTH: usize = 16;

/// Top-level error type for ingestd.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Catalog (Butler) error
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Entry construction error
    #[error("Entry error: {0}")]
    Entry(#[from] EntryError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Kafka-specific errors.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Subscription or consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Offset commit failed
    #[error("Offset commit failed: {0}")]
    OffsetCommit(String),

    /// Message parse error
    #[error("Message parse error: {0}")]
    MessageParse(String),
}

/// Errors reported by the catalog.
///
/// `MissingDatasetType` and `MissingCollection` are the two structural
/// errors the bulk engine repairs in place; every other variant sends the
/// batch into narrowing.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Dataset type is not registered
    #[error("Dataset type not registered: {name}")]
    MissingDatasetType { name: String },

    /// Run collection is not registered
    #[error("Run collection not registered: {run}")]
    MissingCollection { run: String },

    /// Dataset already registered with a different definition
    #[error("Conflicting definition: {0}")]
    ConflictingDefinition(String),

    /// Backing file could not be read
    #[error("Cannot read {path}: {message}")]
    FileUnreadable { path: String, message: String },

    /// Catalog could not be reached
    #[error("Catalog connection failed: {0}")]
    Connection(String),

    /// Catalog rejected a request
    #[error("Catalog request failed ({status}): {message}")]
    Request { status: u16, message: String },

    /// Anything else, optionally chained to an underlying cause
    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<Box<CatalogError>>,
    },
}

impl CatalogError {
    /// Build an `Other` error without a cause.
    pub fn other(message: impl Into<String>) -> Self {
        CatalogError::Other {
            message: message.into(),
            source: None,
        }
    }

    /// Build an `Other` error wrapping `cause`.
    pub fn caused_by(message: impl Into<String>, cause: CatalogError) -> Self {
        CatalogError::Other {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Whether the engine can repair this error by registering schema.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            CatalogError::MissingDatasetType { .. } | CatalogError::MissingCollection { .. }
        )
    }
}

/// Errors raised while turning a message into an [`crate::entries::Entry`].
#[derive(Error, Debug)]
pub enum EntryError {
    /// `rubin_butler` flag absent or not a recognized kind
    #[error("Unknown data kind: {0}")]
    UnknownKind(String),

    /// No mapping configured for the lookup key
    #[error("No location mapping for key '{key}'")]
    MissingMapping { key: String },

    /// Rewriting the URL left it unchanged
    #[error("Mapping '{key}' did not rewrite {url}")]
    Mapping { key: String, url: String },

    /// Sidecar metadata absent or unresolvable
    #[error("Metadata error: {0}")]
    Metadata(String),
}

/// Terminal failure for a single dataset after isolation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to ingest {location}: {cause}")]
pub struct IsolationFailure {
    /// Stored location of the dataset that could not be ingested
    pub location: String,
    /// Human-readable cause chain
    pub cause: String,
}

impl IsolationFailure {
    /// Create a failure for `location` with the given cause.
    pub fn new(location: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            cause: cause.into(),
        }
    }
}

/// Render an error and its chain of sources as `"outer; inner; ..."`.
///
/// Walks `source()` iteratively and stops after [`MAX_CAUSE_DEPTH`] hops.
pub fn extract_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();

    while let Some(cause) = current {
        if parts.len() >= MAX_CAUSE_DEPTH {
            parts.push("...".to_string());
            break;
        }
        parts.push(cause.to_string());
        current = cause.source();
    }

    parts.join("; ")
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let kafka_err = KafkaError::ConnectionFailed {
            broker: "localhost:9092".into(),
            message: "connection refused".into(),
        };
        let err: Error = kafka_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_repairable_errors() {
        assert!(CatalogError::MissingDatasetType {
            name: "calexp".into()
        }
        .is_repairable());
        assert!(CatalogError::MissingCollection {
            run: "HSC/runs/RC2".into()
        }
        .is_repairable());
        assert!(!CatalogError::other("boom").is_repairable());
    }

    #[test]
    fn test_extract_cause_walks_chain() {
        let err = CatalogError::caused_by(
            "ingest failed",
            CatalogError::caused_by(
                "formatter error",
                CatalogError::FileUnreadable {
                    path: "/data/a.fits".into(),
                    message: "truncated".into(),
                },
            ),
        );

        assert_eq!(
            extract_cause(&err),
            "ingest failed; formatter error; Cannot read /data/a.fits: truncated"
        );
    }

    #[test]
    fn test_extract_cause_is_capped() {
        let mut err = CatalogError::other("root");
        for i in 0..100 {
            err = CatalogError::caused_by(format!("level {}", i), err);
        }

        let rendered = extract_cause(&err);
        assert_eq!(rendered.split("; ").count(), MAX_CAUSE_DEPTH + 1);
        assert!(rendered.ends_with("..."));
    }

    #[test]
    fn test_isolation_failure_names_location() {
        let failure = IsolationFailure::new("file:///rucio/data.fits", "truncated");
        assert!(failure.to_string().contains("file:///rucio/data.fits"));
    }
}
