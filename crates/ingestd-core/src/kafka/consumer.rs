//! Kafka consumer for replication-completion events.
//!
//! Offsets are committed manually, after a batch has been drained through
//! the ingest engine. Transient failures are retried with exponential
//! backoff: `min(max_delay, base_delay * 2^attempt)` plus up to ±25% jitter.

use super::MessageSource;
use crate::config::{KafkaConfig, OffsetReset};
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for exponential backoff retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_retries: u32,
    /// Whether to randomize delays by ±25%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a retry config with custom settings.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff delay before retry number `attempt`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let capped = base_ms.saturating_mul(1u64 << attempt.min(20)).min(max_ms);

        if !self.jitter {
            return Duration::from_millis(capped);
        }

        let range = capped / 4;
        let noise = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64
            % (range * 2 + 1);
        Duration::from_millis(capped.saturating_sub(range) + noise)
    }
}

/// Builder for creating a Kafka consumer.
pub struct KafkaConsumerBuilder {
    config: KafkaConfig,
    topics: Vec<String>,
    retry_config: RetryConfig,
}

impl KafkaConsumerBuilder {
    /// Create a builder subscribing to `topics`.
    pub fn new(config: KafkaConfig, topics: Vec<String>) -> Self {
        Self {
            config,
            topics,
            retry_config: RetryConfig::default(),
        }
    }

    /// Set custom retry configuration.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Build the consumer and subscribe.
    pub fn build(self) -> Result<SmartKafkaConsumer> {
        let brokers = self.config.brokers.join(",");
        let client_id = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "ingestd".to_string());

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &brokers)
            .set("group.id", &self.config.group_id)
            .set("client.id", &client_id)
            // Offsets are committed only once a batch has been ingested
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                match self.config.auto_offset_reset {
                    OffsetReset::Earliest => "earliest",
                    OffsetReset::Latest => "latest",
                },
            )
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            // Must exceed the longest batch drain, isolation included
            .set(
                "max.poll.interval.ms",
                self.config.max_poll_interval_ms.to_string(),
            );

        let security = &self.config.security;
        if let Some(ref protocol) = security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
        }

        let consumer: StreamConsumer = client_config.create().map_err(|e| {
            Error::Kafka(KafkaError::ConnectionFailed {
                broker: brokers.clone(),
                message: e.to_string(),
            })
        })?;

        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| Error::Kafka(KafkaError::ConsumerGroup(e.to_string())))?;

        info!(
            topics = ?self.topics,
            group = %self.config.group_id,
            servers = %brokers,
            client_id = %client_id,
            "Kafka consumer subscribed"
        );

        Ok(SmartKafkaConsumer {
            consumer,
            topics: self.topics,
            retry_config: self.retry_config,
            consecutive_failures: AtomicU32::new(0),
        })
    }
}

/// Kafka consumer with batch polling and retried commits.
pub struct SmartKafkaConsumer {
    consumer: StreamConsumer,
    topics: Vec<String>,
    retry_config: RetryConfig,
    consecutive_failures: AtomicU32,
}

impl SmartKafkaConsumer {
    /// Poll up to `max_messages`, returning early once `timeout` elapses.
    pub async fn poll_batch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<KafkaMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let stream = self
            .consumer
            .stream()
            .map(|result| result.map(|msg| Self::convert_message(&msg)));
        drain_stream(stream, max_messages, deadline).await
    }

    fn convert_message(msg: &BorrowedMessage) -> KafkaMessage {
        KafkaMessage {
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|v| v.to_vec()),
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: msg.timestamp().to_millis().unwrap_or(0),
        }
    }

    /// Commit offsets for `(topic, partition, offset)` triples.
    ///
    /// Each committed offset is `offset + 1`, the next message to read.
    pub fn commit_offsets(&self, offsets: &[(String, i32, i64)]) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, offset) in offsets {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
                .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| Error::Kafka(KafkaError::OffsetCommit(e.to_string())))?;

        debug!(offsets = ?offsets, "Batch offsets committed");
        Ok(())
    }

    /// Commit the highest offset per partition of `messages`, retrying with backoff.
    pub async fn commit_batch(&self, messages: &[KafkaMessage]) -> Result<()> {
        let offsets = highest_offsets(messages);
        if offsets.is_empty() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.commit_offsets(&offsets) {
                Ok(()) => {
                    self.record_success();
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.retry_config.max_retries {
                        warn!(
                            attempt = attempt,
                            max_retries = self.retry_config.max_retries,
                            error = %e,
                            "Batch offset commit failed after max retries"
                        );
                        return Err(e);
                    }

                    let delay = self.retry_config.calculate_delay(attempt);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Batch offset commit failed, retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Subscribed topics.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Reset the failure counter.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Delay suggested by the current run of consecutive failures.
    pub fn current_backoff_delay(&self) -> Duration {
        self.retry_config
            .calculate_delay(self.consecutive_failures.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl MessageSource for SmartKafkaConsumer {
    async fn consume(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<KafkaMessage>> {
        match self.poll_batch(max_messages, timeout).await {
            Ok(batch) => {
                self.record_success();
                Ok(batch)
            }
            Err(e) => {
                let failures = self.record_failure();
                warn!(failures = failures, error = %e, "Poll failed");
                Err(e)
            }
        }
    }

    async fn commit(&self, messages: &[KafkaMessage]) -> Result<()> {
        self.commit_batch(messages).await
    }

    fn backoff_delay(&self) -> Duration {
        self.current_backoff_delay()
    }
}

/// Collect up to `max_messages` from `stream` until `deadline`.
///
/// A stream error ends the batch. Messages received before it are still
/// returned, since the consumer has already moved past them; the error is
/// returned only when nothing was received.
async fn drain_stream<S, E>(
    stream: S,
    max_messages: usize,
    deadline: tokio::time::Instant,
) -> Result<Vec<KafkaMessage>>
where
    S: Stream<Item = std::result::Result<KafkaMessage, E>>,
    E: std::fmt::Display,
{
    tokio::pin!(stream);
    let mut batch = Vec::with_capacity(max_messages);

    while batch.len() < max_messages {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(message))) => batch.push(message),
            Ok(Some(Err(e))) => {
                if batch.is_empty() {
                    return Err(Error::Kafka(KafkaError::ConsumerGroup(e.to_string())));
                }
                warn!(received = batch.len(), error = %e, "Poll failed, keeping partial batch");
                break;
            }
            Ok(None) | Err(_) => break,
        }
    }

    Ok(batch)
}

/// Highest offset seen per (topic, partition), in topic/partition order.
pub fn highest_offsets(messages: &[KafkaMessage]) -> Vec<(String, i32, i64)> {
    let mut highest: BTreeMap<(&str, i32), i64> = BTreeMap::new();
    for msg in messages {
        let offset = highest.entry((msg.topic.as_str(), msg.partition)).or_insert(msg.offset);
        *offset = (*offset).max(msg.offset);
    }
    highest
        .into_iter()
        .map(|((topic, partition), offset)| (topic.to_string(), partition, offset))
        .collect()
}

/// A Kafka message with its coordinates.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    /// Message key (optional)
    pub key: Option<Vec<u8>>,

    /// Message value (optional)
    pub value: Option<Vec<u8>>,

    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Message timestamp (milliseconds since epoch)
    pub timestamp: i64,
}

impl KafkaMessage {
    /// Create a message carrying `value`, mainly for tests and replays.
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: &str) -> Self {
        Self {
            key: None,
            value: Some(value.as_bytes().to_vec()),
            topic: topic.into(),
            partition,
            offset,
            timestamp: 0,
        }
    }

    /// Get the message value as a string.
    pub fn value_str(&self) -> Option<&str> {
        self.value
            .as_ref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_offsets_per_partition() {
        let messages = vec![
            KafkaMessage::new("XRD1-test", 0, 5, "{}"),
            KafkaMessage::new("XRD1-test", 0, 7, "{}"),
            KafkaMessage::new("XRD1-test", 1, 3, "{}"),
            KafkaMessage::new("XRD2-test", 0, 2, "{}"),
            KafkaMessage::new("XRD1-test", 0, 6, "{}"),
        ];

        assert_eq!(
            highest_offsets(&messages),
            vec![
                ("XRD1-test".to_string(), 0, 7),
                ("XRD1-test".to_string(), 1, 3),
                ("XRD2-test".to_string(), 0, 2),
            ]
        );
        assert!(highest_offsets(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_keeps_received_messages() {
        let stream = futures::stream::iter(vec![
            Ok(KafkaMessage::new("XRD1-test", 0, 10, "{}")),
            Ok(KafkaMessage::new("XRD1-test", 0, 11, "{}")),
            Err("broker transport failure"),
            Ok(KafkaMessage::new("XRD1-test", 0, 12, "{}")),
        ]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);

        let batch = drain_stream(stream, 10, deadline).await.unwrap();

        let offsets: Vec<i64> = batch.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![10, 11]);
    }

    #[tokio::test]
    async fn test_stream_error_on_empty_batch_is_reported() {
        let stream = futures::stream::iter(vec![
            Err("broker transport failure"),
            Ok(KafkaMessage::new("XRD1-test", 0, 10, "{}")),
        ]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);

        let err = drain_stream(stream, 10, deadline).await.unwrap_err();

        assert!(err.to_string().contains("broker transport failure"));
    }

    #[tokio::test]
    async fn test_drain_stops_at_max_messages() {
        let stream = futures::stream::iter(
            (0..5).map(|offset| Ok::<_, &str>(KafkaMessage::new("XRD1-test", 0, offset, "{}"))),
        );
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);

        let batch = drain_stream(stream, 3, deadline).await.unwrap();

        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_value_str() {
        let msg = KafkaMessage::new("t", 0, 0, r#"{"payload": {}}"#);
        assert_eq!(msg.value_str(), Some(r#"{"payload": {}}"#));
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 10);
        assert!(config.jitter);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_calculate_delay_caps_at_max() {
        let config = RetryConfig::new(Duration::from_secs(1), Duration::from_secs(30), 100)
            .without_jitter();

        assert_eq!(config.calculate_delay(10), Duration::from_secs(30));
        assert_eq!(config.calculate_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig::new(Duration::from_millis(1000), Duration::from_secs(30), 10);

        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= Duration::from_millis(1250));
    }
}
