//! Catalog factory for creating catalog instances from configuration.

use super::{Catalog, MemoryCatalog, RestCatalogClient};
use crate::config::{ButlerConfig, CatalogType};
use crate::{Error, Result};
use std::sync::Arc;

/// Creates a catalog implementation for one [`CatalogType`].
pub trait CatalogFactory: Send + Sync {
    /// Create a new catalog instance.
    fn create(&self, config: &ButlerConfig) -> Result<Arc<dyn Catalog>>;

    /// Get the catalog type this factory creates.
    fn catalog_type(&self) -> CatalogType;

    /// Check if this factory supports the given configuration.
    fn supports(&self, config: &ButlerConfig) -> bool {
        self.catalog_type() == config.catalog_type
    }
}

/// Registry of catalog factories.
pub struct CatalogFactoryRegistry {
    factories: Vec<Box<dyn CatalogFactory>>,
}

impl CatalogFactoryRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Create a registry with the REST and in-memory factories.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(RestCatalogFactory));
        registry.register(Box::new(MemoryCatalogFactory));
        registry
    }

    /// Register a new catalog factory.
    pub fn register(&mut self, factory: Box<dyn CatalogFactory>) {
        self.factories.push(factory);
    }

    /// Create a catalog instance based on configuration.
    pub fn create(&self, config: &ButlerConfig) -> Result<Arc<dyn Catalog>> {
        self.factories
            .iter()
            .find(|f| f.supports(config))
            .ok_or_else(|| {
                Error::Config(format!(
                    "No catalog factory found for catalog type: {:?}",
                    config.catalog_type
                ))
            })?
            .create(config)
    }

    /// Get the supported catalog types.
    pub fn supported_types(&self) -> Vec<CatalogType> {
        self.factories.iter().map(|f| f.catalog_type()).collect()
    }
}

impl Default for CatalogFactoryRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Factory for the Butler REST client.
pub struct RestCatalogFactory;

impl CatalogFactory for RestCatalogFactory {
    fn create(&self, config: &ButlerConfig) -> Result<Arc<dyn Catalog>> {
        let rest_uri = config
            .rest_uri
            .as_deref()
            .ok_or_else(|| Error::Config("REST catalog requires rest_uri to be set".into()))?;

        Ok(Arc::new(RestCatalogClient::new(config, rest_uri)?))
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Rest
    }
}

/// Factory for the in-memory catalog.
pub struct MemoryCatalogFactory;

impl CatalogFactory for MemoryCatalogFactory {
    fn create(&self, config: &ButlerConfig) -> Result<Arc<dyn Catalog>> {
        let mut catalog = MemoryCatalog::new(config.repo.clone());
        if let Some(instrument) = &config.instrument {
            catalog = catalog.with_instrument(instrument.clone());
        }
        Ok(Arc::new(catalog))
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TransferMode;
    use crate::config::MappingKey;

    fn butler_config(catalog_type: CatalogType, rest_uri: Option<&str>) -> ButlerConfig {
        ButlerConfig {
            repo: "/repo/main".into(),
            instrument: Some("lsst.obs.subaru.HyperSuprimeCam".into()),
            catalog_type,
            rest_uri: rest_uri.map(String::from),
            credential: None,
            request_timeout_seconds: 5,
            data_product_transfer: TransferMode::Auto,
            raw_transfer: TransferMode::Direct,
            archive_transfer: TransferMode::Auto,
            mapping_key: MappingKey::RseScope,
        }
    }

    #[test]
    fn test_registry_supported_types() {
        let registry = CatalogFactoryRegistry::with_defaults();
        assert_eq!(
            registry.supported_types(),
            vec![CatalogType::Rest, CatalogType::Memory]
        );
    }

    #[test]
    fn test_create_memory_catalog() {
        let registry = CatalogFactoryRegistry::default();
        let catalog = registry
            .create(&butler_config(CatalogType::Memory, None))
            .unwrap();
        assert_eq!(catalog.catalog_type(), CatalogType::Memory);
        assert_eq!(catalog.repo(), "/repo/main");
    }

    #[tokio::test]
    async fn test_create_rest_catalog() {
        let registry = CatalogFactoryRegistry::default();
        let catalog = registry
            .create(&butler_config(CatalogType::Rest, Some("http://localhost:8080/")))
            .unwrap();
        assert_eq!(catalog.catalog_type(), CatalogType::Rest);
    }

    #[test]
    fn test_rest_requires_uri() {
        let result = RestCatalogFactory.create(&butler_config(CatalogType::Rest, None));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_registry() {
        let registry = CatalogFactoryRegistry::new();
        assert!(registry
            .create(&butler_config(CatalogType::Memory, None))
            .is_err());
    }
}
