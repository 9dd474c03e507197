//! Kafka consumer for replication-completion events.

mod consumer;

pub use consumer::{
    highest_offsets, KafkaConsumerBuilder, KafkaMessage, RetryConfig, SmartKafkaConsumer,
};

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Source of message batches for the daemon loop.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch up to `max_messages`, waiting at most `timeout`.
    ///
    /// An empty batch is not an error.
    async fn consume(&self, max_messages: usize, timeout: Duration)
        -> Result<Vec<KafkaMessage>>;

    /// Mark `messages` as processed.
    async fn commit(&self, messages: &[KafkaMessage]) -> Result<()>;

    /// How long to wait before polling again after a failure.
    fn backoff_delay(&self) -> Duration {
        Duration::from_secs(1)
    }
}
