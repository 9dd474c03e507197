//! Consume → ingest → commit loop.

use crate::catalog::{Catalog, CatalogFactoryRegistry};
use crate::config::Config;
use crate::entries::{Entry, EntryFactory};
use crate::ingest::{IngestReport, IngestStats, Ingester, TransferSettings};
use crate::kafka::{KafkaConsumerBuilder, MessageSource};
use crate::mapper::Mapper;
use crate::message::Message;
use crate::{CatalogError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Per-batch summary returned by [`IngestDaemon::process`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSummary {
    /// Messages consumed
    pub messages: usize,
    /// Messages skipped before ingest
    pub skipped: usize,
    /// Catalog outcome for the rest
    pub report: IngestReport,
}

/// Daemon-level counters.
#[derive(Debug, Default)]
pub struct DaemonStats {
    pub batches: AtomicU64,
    pub messages: AtomicU64,
    pub skipped: AtomicU64,
    pub errors: AtomicU64,
}

/// Long-running ingest daemon.
pub struct IngestDaemon {
    config: Config,
    source: Box<dyn MessageSource>,
    catalog: Arc<dyn Catalog>,
    factory: EntryFactory,
    ingester: Ingester,
    stats: DaemonStats,
    shutdown_tx: broadcast::Sender<()>,
    span: Span,
}

impl IngestDaemon {
    /// Build the catalog client, mapper and Kafka consumer from `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let catalog = CatalogFactoryRegistry::with_defaults().create(&config.butler)?;
        let consumer =
            KafkaConsumerBuilder::new(config.kafka.clone(), config.topic_names()).build()?;

        Ok(Self::with_parts(config, Box::new(consumer), catalog))
    }

    /// Assemble a daemon from an existing message source and catalog.
    pub fn with_parts(
        config: Config,
        source: Box<dyn MessageSource>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        let mapper = Mapper::from_config(&config);
        let factory = EntryFactory::new(catalog.clone(), mapper);
        let ingester = Ingester::new(catalog.clone(), TransferSettings::from(&config.butler));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            source,
            catalog,
            factory,
            ingester,
            stats: DaemonStats::default(),
            shutdown_tx,
            span: tracing::info_span!("daemon"),
        }
    }

    /// Log through `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Sender that stops [`run`](Self::run) when signalled.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Daemon counters.
    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    /// Ingest counters.
    pub fn ingest_stats(&self) -> &IngestStats {
        self.ingester.stats()
    }

    /// Loop over [`process`](Self::process) until shutdown is signalled.
    ///
    /// A batch in progress is finished before the loop exits, unless it is
    /// being held for an unreachable catalog; that batch stays uncommitted.
    pub async fn run(&self) -> Result<()> {
        let span = self.span.clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        match self.catalog.health_check().await {
            Ok(health) if health.is_healthy => info!(
                repo = %self.catalog.repo(),
                catalog_type = ?health.catalog_type,
                response_time_ms = health.response_time_ms,
                "Catalog reachable"
            ),
            Ok(health) => warn!(
                repo = %self.catalog.repo(),
                message = ?health.message,
                "Catalog reports unhealthy"
            ),
            Err(e) => warn!(repo = %self.catalog.repo(), error = %e, "Catalog health check failed"),
        }

        info!(topics = ?self.config.topic_names(), "Ingest daemon started");

        loop {
            if shutdown_requested(&mut shutdown_rx) {
                break;
            }

            if let Err(e) = self.process().await {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                let delay = self.source.backoff_delay();
                error!(error = %e, retry_in_ms = delay.as_millis() as u64, "Batch failed");

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let stats = self.ingester.stats().snapshot();
        info!(
            batches = self.stats.batches.load(Ordering::Relaxed),
            messages = self.stats.messages.load(Ordering::Relaxed),
            skipped = self.stats.skipped.load(Ordering::Relaxed),
            errors = self.stats.errors.load(Ordering::Relaxed),
            files_ingested = stats.files_ingested,
            isolation_failures = stats.isolation_failures,
            "Ingest daemon stopped"
        );
        Ok(())
    }

    /// Consume one batch, ingest it and commit its offsets.
    ///
    /// Messages that cannot be turned into entries are logged and skipped.
    /// Offsets are committed once the whole batch has been handled, failed
    /// files included. Failures while the catalog is unreachable hold the
    /// batch until it comes back.
    pub async fn process(&self) -> Result<ProcessSummary> {
        let messages = self
            .source
            .consume(self.config.kafka.num_messages, self.config.timeout())
            .await?;
        if messages.is_empty() {
            return Ok(ProcessSummary::default());
        }

        debug!(messages = messages.len(), "Batch received");
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .messages
            .fetch_add(messages.len() as u64, Ordering::Relaxed);

        let mut entries = Vec::with_capacity(messages.len());
        let mut skipped = 0;
        for raw in &messages {
            let message = match Message::from_kafka(raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        topic = %raw.topic,
                        partition = raw.partition,
                        offset = raw.offset,
                        error = %e,
                        "Skipping unparseable message"
                    );
                    skipped += 1;
                    continue;
                }
            };

            match self.factory.create_entry(&message).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(message = %message, error = %e, "Skipping message");
                    skipped += 1;
                }
            }
        }
        self.stats.skipped.fetch_add(skipped as u64, Ordering::Relaxed);

        let report = match self.ingest_while_reachable(entries).await {
            Some(report) => report,
            None => {
                warn!(
                    messages = messages.len(),
                    "Shutdown while the catalog was unreachable, leaving batch uncommitted"
                );
                return Err(CatalogError::Connection(
                    "catalog unreachable, batch left uncommitted".into(),
                )
                .into());
            }
        };
        self.source.commit(&messages).await?;

        Ok(ProcessSummary {
            messages: messages.len(),
            skipped,
            report,
        })
    }
}

impl IngestDaemon {
    /// Ingest `entries`, holding the batch while the catalog is down.
    ///
    /// Failures seen while the catalog health check fails are retried after
    /// the source's backoff delay instead of being committed as terminal.
    /// Returns `None` if shutdown is signalled while waiting.
    async fn ingest_while_reachable(&self, entries: Vec<Entry>) -> Option<IngestReport> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut pending = entries;
        let mut confirmed = Vec::new();

        loop {
            let mut report = self.ingester.ingest(pending.clone()).await;
            confirmed.append(&mut report.ingested);
            if report.failures.is_empty() || self.catalog_reachable().await {
                report.ingested = confirmed;
                return Some(report);
            }

            pending.retain(|entry| {
                report
                    .failures
                    .iter()
                    .any(|f| f.location == entry.file_to_ingest())
            });
            let delay = self.source.backoff_delay();
            warn!(
                failed = pending.len(),
                retry_in_ms = delay.as_millis() as u64,
                "Catalog unreachable, holding batch"
            );

            tokio::select! {
                _ = shutdown_rx.recv() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn catalog_reachable(&self) -> bool {
        matches!(self.catalog.health_check().await, Ok(health) if health.is_healthy)
    }
}

fn shutdown_requested(rx: &mut broadcast::Receiver<()>) -> bool {
    match rx.try_recv() {
        Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
            info!("Shutdown signal received");
            true
        }
        Err(broadcast::error::TryRecvError::Lagged(_)) => true,
        Err(broadcast::error::TryRecvError::Empty) => false,
    }
}
