//! Configuration structures for ingestd.
//!
//! Configuration is loaded from a TOML file. The `[topics]` table doubles as
//! the list of Kafka topics to subscribe to and as the location mapping used
//! to rewrite Rucio URLs into local paths.

use crate::catalog::TransferMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Kafka configuration
    pub kafka: KafkaConfig,

    /// Mapping key -> Rucio/filesystem prefixes
    #[serde(default)]
    pub topics: BTreeMap<String, TopicMapping>,

    /// Butler (catalog) configuration
    pub butler: ButlerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Kafka consumer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka brokers
    #[serde(default)]
    pub brokers: Vec<String>,

    /// Consumer group ID
    #[serde(default)]
    pub group_id: String,

    /// Maximum number of messages consumed per batch
    #[serde(default = "default_num_messages")]
    pub num_messages: usize,

    /// How long to wait for a batch to fill, in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Max poll interval in milliseconds (must exceed the longest batch drain)
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,

    /// Auto offset reset strategy
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

/// Kafka auto offset reset strategy.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from earliest offset
    #[default]
    Earliest,
    /// Start from latest offset
    Latest,
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,
}

/// Prefix substitution for one mapping key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TopicMapping {
    /// Prefix of URLs as Rucio reports them
    pub rucio_prefix: String,

    /// Prefix of the same files on the local filesystem
    pub fs_prefix: String,
}

impl TopicMapping {
    /// Create a mapping, normalizing both prefixes.
    pub fn new(rucio_prefix: impl Into<String>, fs_prefix: impl Into<String>) -> Self {
        let mut mapping = Self {
            rucio_prefix: rucio_prefix.into(),
            fs_prefix: fs_prefix.into(),
        };
        mapping.normalize();
        mapping
    }

    /// Make both prefixes end with a path separator.
    pub fn normalize(&mut self) {
        for prefix in [&mut self.rucio_prefix, &mut self.fs_prefix] {
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
        }
    }
}

/// How the mapping key is built from a message.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MappingKey {
    /// `"{dst-rse}-{scope}"`
    #[default]
    RseScope,
    /// Bare `dst-rse`
    Rse,
}

/// Catalog implementation to talk to.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CatalogType {
    /// Butler REST server
    #[default]
    Rest,
    /// In-process registry (dry runs)
    Memory,
}

/// Butler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ButlerConfig {
    /// Butler repository location
    #[serde(default)]
    pub repo: String,

    /// Instrument class name, used to name raw runs
    pub instrument: Option<String>,

    /// Catalog type
    #[serde(default)]
    pub catalog_type: CatalogType,

    /// REST catalog URI (when catalog_type is rest)
    pub rest_uri: Option<String>,

    /// Bearer token for the REST catalog
    pub credential: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Transfer mode for data products
    #[serde(default = "default_data_product_transfer")]
    pub data_product_transfer: TransferMode,

    /// Transfer mode for raw files
    #[serde(default = "default_raw_transfer")]
    pub raw_transfer: TransferMode,

    /// Transfer mode for zip archives
    #[serde(default = "default_archive_transfer")]
    pub archive_transfer: TransferMode,

    /// How mapping keys are derived from messages
    #[serde(default)]
    pub mapping_key: MappingKey,
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Plain text format (default)
    #[default]
    Text,
}

// Default value functions
fn default_num_messages() -> usize {
    1
}
fn default_timeout_seconds() -> u64 {
    1
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_max_poll_interval_ms() -> u32 {
    300000 // a batch may spend minutes in isolation
}
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_data_product_transfer() -> TransferMode {
    TransferMode::Auto
}
fn default_raw_transfer() -> TransferMode {
    TransferMode::Direct
}
fn default_archive_transfer() -> TransferMode {
    TransferMode::Auto
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse, normalize and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        config.validate()?;

        tracing::info!(
            repo = %config.butler.repo,
            brokers = %config.kafka.brokers.join(","),
            topics = ?config.topic_names(),
            num_messages = config.kafka.num_messages,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Normalize mapping prefixes so they all end with `/`.
    pub fn normalize(&mut self) {
        for mapping in self.topics.values_mut() {
            mapping.normalize();
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.kafka.brokers.is_empty() {
            return Err(crate::Error::Config("At least one broker required".into()));
        }

        if self.kafka.group_id.is_empty() {
            return Err(crate::Error::Config("Kafka group_id is required".into()));
        }

        if self.kafka.num_messages == 0 {
            return Err(crate::Error::Config(
                "num_messages must be at least 1".into(),
            ));
        }

        if self.topics.is_empty() {
            return Err(crate::Error::Config("At least one topic required".into()));
        }

        for (key, mapping) in &self.topics {
            if mapping.rucio_prefix.trim_matches('/').is_empty()
                || mapping.fs_prefix.trim_matches('/').is_empty()
            {
                return Err(crate::Error::Config(format!(
                    "Topic '{}' needs both rucio_prefix and fs_prefix",
                    key
                )));
            }
        }

        if self.butler.repo.is_empty() {
            return Err(crate::Error::Config(
                "Butler repo is required in 'butler' section".into(),
            ));
        }

        if self.butler.catalog_type == CatalogType::Rest && self.butler.rest_uri.is_none() {
            return Err(crate::Error::Config(
                "REST catalog requires rest_uri in 'butler' section".into(),
            ));
        }

        if self.butler.catalog_type == CatalogType::Memory {
            tracing::warn!("In-memory catalog configured, nothing will be persisted");
        }

        Ok(())
    }

    /// Kafka topics to subscribe to.
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Batch wait time.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.kafka.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        [kafka]
        brokers = ["kafka:9092"]
        group_id = "my_test_group"
        num_messages = 50

        [topics.XRD1-test]
        rucio_prefix = "root://xrd1:1094//rucio"
        fs_prefix = "file:///rucio/disks/xrd1/rucio"

        [topics.XRD2-test]
        rucio_prefix = "root://xrd2:1095//rucio/"
        fs_prefix = "file:///rucio/disks/xrd2/rucio/"

        [butler]
        repo = "/tmp/repo"
        instrument = "lsst.obs.subaru.HyperSuprimeCam"
        rest_uri = "http://localhost:8080"
    "#;

    #[test]
    fn test_attributes() {
        let config = Config::from_toml(VALID).unwrap();

        assert_eq!(config.kafka.num_messages, 50);
        assert_eq!(config.kafka.timeout_seconds, 1);
        assert_eq!(config.kafka.brokers, vec!["kafka:9092".to_string()]);
        assert_eq!(config.kafka.group_id, "my_test_group");
        assert_eq!(config.topic_names(), vec!["XRD1-test", "XRD2-test"]);
        assert_eq!(config.butler.repo, "/tmp/repo");
        assert_eq!(
            config.butler.instrument.as_deref(),
            Some("lsst.obs.subaru.HyperSuprimeCam")
        );
        assert_eq!(config.butler.catalog_type, CatalogType::Rest);
        assert_eq!(config.butler.data_product_transfer, TransferMode::Auto);
        assert_eq!(config.butler.raw_transfer, TransferMode::Direct);
        assert_eq!(config.butler.mapping_key, MappingKey::RseScope);
    }

    #[test]
    fn test_prefixes_are_normalized() {
        let config = Config::from_toml(VALID).unwrap();

        let xrd1 = &config.topics["XRD1-test"];
        assert_eq!(xrd1.rucio_prefix, "root://xrd1:1094//rucio/");
        assert_eq!(xrd1.fs_prefix, "file:///rucio/disks/xrd1/rucio/");

        // Already normalized prefixes are left alone
        let xrd2 = &config.topics["XRD2-test"];
        assert_eq!(xrd2.rucio_prefix, "root://xrd2:1095//rucio/");
    }

    #[test]
    fn test_no_brokers() {
        let content = VALID.replace(r#"brokers = ["kafka:9092"]"#, "");
        let err = Config::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("broker"));
    }

    #[test]
    fn test_no_group_id() {
        let content = VALID.replace(r#"group_id = "my_test_group""#, "");
        let err = Config::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("group_id"));
    }

    #[test]
    fn test_no_topics() {
        let content = r#"
            [kafka]
            brokers = ["kafka:9092"]
            group_id = "g"

            [butler]
            repo = "/tmp/repo"
            catalog_type = "memory"
        "#;
        let err = Config::from_toml(content).unwrap_err();
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn test_no_repo() {
        let content = VALID.replace(r#"repo = "/tmp/repo""#, "");
        let err = Config::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("Butler repo"));
    }

    #[test]
    fn test_rest_requires_uri() {
        let content = VALID.replace(r#"rest_uri = "http://localhost:8080""#, "");
        let err = Config::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("rest_uri"));
    }

    #[test]
    fn test_memory_catalog_needs_no_uri() {
        let content = VALID
            .replace(r#"rest_uri = "http://localhost:8080""#, r#"catalog_type = "memory""#);
        let config = Config::from_toml(&content).unwrap();
        assert_eq!(config.butler.catalog_type, CatalogType::Memory);
    }

    #[test]
    fn test_mapping_key_and_transfer_overrides() {
        let content = VALID.replace(
            r#"repo = "/tmp/repo""#,
            "repo = \"/tmp/repo\"\nmapping_key = \"rse\"\ndata_product_transfer = \"copy\"",
        );
        let config = Config::from_toml(&content).unwrap();
        assert_eq!(config.butler.mapping_key, MappingKey::Rse);
        assert_eq!(config.butler.data_product_transfer, TransferMode::Copy);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ingestd.toml");
        std::fs::write(&path, VALID).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.topics.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/ingestd.toml")).unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[test]
    fn test_default_monitoring_config() {
        let config = MonitoringConfig::default();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }
}
