//! ingestd core - Kafka to Butler file ingest daemon
//!
//! This library consumes Rucio replication-completion events from Kafka,
//! rewrites each replicated file's URL to a local location and registers
//! the file in a Butler data repository with:
//!
//! - Kind-based dispatch for raw files, data products, zip bundles and
//!   dimension records
//! - Bulk registration that repairs missing dataset types and runs in place
//! - Narrowing and per-dataset isolation when a batch partially fails
//! - Offsets committed only after a batch has been handled

pub mod catalog;
pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod entries;
pub mod error;
pub mod ingest;
pub mod kafka;
pub mod mapper;
pub mod message;

// Re-export commonly used types
pub use config::Config;
pub use engine::IngestDaemon;
pub use error::{extract_cause, CatalogError, EntryError, IsolationFailure, KafkaError};
pub use error::{Error, Result};
