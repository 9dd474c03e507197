//! Builds [`Entry`] values from parsed messages.

use super::{DataKind, Entry};
use crate::catalog::{Catalog, DatasetRef, DatasetTypeSpec, FileDataset, SerializedDatasetRef};
use crate::error::extract_cause;
use crate::mapper::Mapper;
use crate::message::{Message, Sidecar};
use crate::EntryError;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn, Instrument, Span};

/// Turns messages into entries, rewriting locations and resolving metadata.
pub struct EntryFactory {
    catalog: Arc<dyn Catalog>,
    mapper: Mapper,
    span: Span,
}

impl EntryFactory {
    /// Create a factory resolving dataset types against `catalog`.
    pub fn new(catalog: Arc<dyn Catalog>, mapper: Mapper) -> Self {
        Self {
            catalog,
            mapper,
            span: tracing::info_span!("entry_factory"),
        }
    }

    /// Log through `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Build the entry for `message`.
    ///
    /// Fails before anything reaches the catalog if the kind is unknown, the
    /// location cannot be rewritten, or a data product's metadata cannot be
    /// resolved.
    pub async fn create_entry(&self, message: &Message) -> Result<Entry, EntryError> {
        self.build(message).instrument(self.span.clone()).await
    }

    async fn build(&self, message: &Message) -> Result<Entry, EntryError> {
        let flag = message.rubin_butler().ok_or_else(|| {
            EntryError::UnknownKind(format!("rubin_butler not specified in {}", message))
        })?;
        let kind = DataKind::from_flag(flag)?;

        let rse = message
            .dst_rse()
            .ok_or_else(|| EntryError::Metadata(format!("no dst-rse in {}", message)))?;
        let url = message
            .dst_url()
            .ok_or_else(|| EntryError::Metadata(format!("no dst-url in {}", message)))?;

        let key = self.mapper.lookup_key(rse, message.scope());
        let file_to_ingest = self.mapper.rewrite(&key, url)?;
        if file_to_ingest == url {
            warn!(key = %key, url = %url, "Mapping did not rewrite URL");
            return Err(EntryError::Mapping {
                key,
                url: url.to_string(),
            });
        }

        debug!(kind = %kind, from = %url, to = %file_to_ingest, "Location rewritten");

        match kind {
            DataKind::DataProduct => {
                let sidecar = message.rubin_sidecar().ok_or_else(|| {
                    EntryError::Metadata(format!("no rubin_sidecar in {}", message))
                })?;
                let sidecar = sidecar.to_value()?;
                let dataset_ref = self.resolve_ref(&sidecar).await?;
                let dataset = FileDataset::new(file_to_ingest, dataset_ref);
                Ok(Entry::with_dataset(url, dataset, sidecar))
            }
            DataKind::RawFile | DataKind::ZipBundle | DataKind::DimensionFile => {
                let sidecar = message.rubin_sidecar().map(opaque_sidecar);
                Ok(Entry::with_path(kind, url, file_to_ingest, sidecar))
            }
        }
    }

    /// Resolve a serialized reference, looking up bare dataset type names.
    async fn resolve_ref(&self, sidecar: &Value) -> Result<DatasetRef, EntryError> {
        let serialized: SerializedDatasetRef = serde_json::from_value(sidecar.clone())
            .map_err(|e| EntryError::Metadata(format!("invalid dataset reference: {}", e)))?;

        let dataset_type = match serialized.dataset_type {
            DatasetTypeSpec::Full(dataset_type) => dataset_type,
            DatasetTypeSpec::Name(name) => self
                .catalog
                .get_dataset_type(&name)
                .await
                .map_err(|e| EntryError::Metadata(extract_cause(&e)))?
                .ok_or_else(|| EntryError::Metadata(format!("unknown dataset type {}", name)))?,
        };

        Ok(DatasetRef {
            id: serialized.id,
            dataset_type,
            data_id: serialized.data_id.into_map(),
            run: serialized.run,
        })
    }
}

/// Sidecars of path-only kinds are kept as-is when they are not JSON.
fn opaque_sidecar(sidecar: &Sidecar) -> Value {
    match sidecar {
        Sidecar::Text(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::from(text.as_str()))
        }
        Sidecar::Object(map) => Value::Object(map.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatasetType, MemoryCatalog};
    use crate::config::{MappingKey, TopicMapping};
    use crate::kafka::KafkaMessage;
    use std::collections::BTreeMap;

    const SIDECAR: &str = r#"{"id":"0ef08762-b0dd-4a02-8b1c-e09b1544992d","datasetType":{"name":"visitSummary","storageClass":"ExposureCatalog","dimensions":["instrument","visit"]},"dataId":{"dataId":{"instrument":"HSC","visit":328,"band":"y","physical_filter":"HSC-Y"}},"run":"HSC/runs/RC2/w_2023_32/DM-40356/20230814T170253Z"}"#;

    fn factory(catalog: Arc<MemoryCatalog>) -> EntryFactory {
        let mut mappings = BTreeMap::new();
        mappings.insert(
            "XRD5-test".to_string(),
            TopicMapping::new("root://xrd5:1098//rucio", "file:///rucio/disks/xrd5/rucio"),
        );
        EntryFactory::new(catalog, Mapper::new(mappings, MappingKey::RseScope))
    }

    fn message(kind: Value, url: &str, sidecar: Option<Value>) -> Message {
        let mut payload = serde_json::json!({
            "dst-rse": "XRD5",
            "dst-url": url,
            "rubin_butler": kind,
            "scope": "test",
        });
        if let Some(sidecar) = sidecar {
            payload["rubin_sidecar"] = sidecar;
        }
        let value = serde_json::json!({ "payload": payload }).to_string();
        Message::from_kafka(&KafkaMessage::new("XRD5-test", 0, 0, &value)).unwrap()
    }

    #[tokio::test]
    async fn test_data_product_entry() {
        let factory = factory(Arc::new(MemoryCatalog::new("/repo")));
        let msg = message(
            Value::from(2),
            "root://xrd5:1098//rucio/test/visitSummary.fits",
            Some(Value::from(SIDECAR)),
        );

        let entry = factory.create_entry(&msg).await.unwrap();

        assert_eq!(entry.kind(), DataKind::DataProduct);
        assert_eq!(
            entry.file_to_ingest(),
            "file:///rucio/disks/xrd5/rucio/test/visitSummary.fits"
        );
        let dataset = entry.dataset().unwrap();
        assert_eq!(dataset.path, entry.file_to_ingest());
        assert_eq!(dataset.refs[0].dataset_type.name, "visitSummary");
        assert_eq!(dataset.refs[0].data_id["visit"], 328);
        assert_eq!(
            dataset.refs[0].run,
            "HSC/runs/RC2/w_2023_32/DM-40356/20230814T170253Z"
        );
    }

    #[tokio::test]
    async fn test_raw_entry_is_path_only() {
        let factory = factory(Arc::new(MemoryCatalog::new("/repo")));
        let msg = message(Value::from(1), "root://xrd5:1098//rucio/raw/HSC-1.fits", None);

        let entry = factory.create_entry(&msg).await.unwrap();

        assert_eq!(entry.kind(), DataKind::RawFile);
        assert!(entry.dataset().is_none());
        assert_eq!(entry.file_to_ingest(), "file:///rucio/disks/xrd5/rucio/raw/HSC-1.fits");
    }

    #[tokio::test]
    async fn test_noop_rewrite_fails() {
        let factory = factory(Arc::new(MemoryCatalog::new("/repo")));
        let msg = message(Value::from(1), "root://xrd9:1094//other/raw.fits", None);

        let err = factory.create_entry(&msg).await.unwrap_err();
        assert!(matches!(err, EntryError::Mapping { .. }));
    }

    #[tokio::test]
    async fn test_unknown_or_missing_kind() {
        let factory = factory(Arc::new(MemoryCatalog::new("/repo")));
        let url = "root://xrd5:1098//rucio/a.fits";

        let err = factory
            .create_entry(&message(Value::from(7), url, None))
            .await
            .unwrap_err();
        assert!(matches!(err, EntryError::UnknownKind(_)));

        let err = factory
            .create_entry(&message(Value::Null, url, None))
            .await
            .unwrap_err();
        assert!(matches!(err, EntryError::UnknownKind(_)));
    }

    #[tokio::test]
    async fn test_data_product_without_sidecar() {
        let factory = factory(Arc::new(MemoryCatalog::new("/repo")));
        let msg = message(Value::from(2), "root://xrd5:1098//rucio/a.fits", None);

        let err = factory.create_entry(&msg).await.unwrap_err();
        assert!(matches!(err, EntryError::Metadata(_)));
    }

    #[tokio::test]
    async fn test_named_dataset_type_is_resolved() {
        let catalog = Arc::new(MemoryCatalog::new("/repo"));
        catalog.add_dataset_type(DatasetType {
            name: "calexp".into(),
            storage_class: "ExposureF".into(),
            dimensions: vec!["instrument".into(), "visit".into(), "detector".into()],
        });
        let factory = factory(catalog);

        let sidecar = serde_json::json!({
            "id": "0ef08762-b0dd-4a02-8b1c-e09b1544992d",
            "datasetType": "calexp",
            "dataId": {"instrument": "HSC", "visit": 328, "detector": 12},
            "run": "HSC/runs/test",
        });
        let known = message(
            Value::from(2),
            "root://xrd5:1098//rucio/calexp.fits",
            Some(sidecar.clone()),
        );
        let entry = factory.create_entry(&known).await.unwrap();
        let dataset_type = &entry.dataset().unwrap().refs[0].dataset_type;
        assert_eq!(dataset_type.storage_class, "ExposureF");

        let mut unknown_sidecar = sidecar;
        unknown_sidecar["datasetType"] = Value::from("deepCoadd");
        let unknown = message(
            Value::from(2),
            "root://xrd5:1098//rucio/coadd.fits",
            Some(unknown_sidecar),
        );
        let err = factory.create_entry(&unknown).await.unwrap_err();
        assert!(err.to_string().contains("deepCoadd"));
    }
}
