//! Daemon orchestration.
//!
//! Ties the Kafka consumer, entry factory and ingester together:
//! - consume a batch of replication events
//! - turn each into an entry, skipping the ones that cannot be resolved
//! - ingest the entries by kind
//! - commit the batch's offsets

mod daemon;

pub use daemon::{DaemonStats, IngestDaemon, ProcessSummary};
