//! Rewrites Rucio URLs into local filesystem locations.

use crate::config::{Config, MappingKey, TopicMapping};
use crate::EntryError;
use std::collections::BTreeMap;

/// Prefix substitution table keyed by mapping key.
#[derive(Debug, Clone)]
pub struct Mapper {
    mappings: BTreeMap<String, TopicMapping>,
    key_strategy: MappingKey,
}

impl Mapper {
    /// Create a mapper. Prefixes are normalized to end with `/`.
    pub fn new(mappings: BTreeMap<String, TopicMapping>, key_strategy: MappingKey) -> Self {
        let mappings = mappings
            .into_iter()
            .map(|(key, mut mapping)| {
                mapping.normalize();
                (key, mapping)
            })
            .collect();
        Self {
            mappings,
            key_strategy,
        }
    }

    /// Build the mapper described by `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.topics.clone(), config.butler.mapping_key)
    }

    /// Mapping key for a destination RSE and scope.
    pub fn lookup_key(&self, rse: &str, scope: Option<&str>) -> String {
        match (self.key_strategy, scope) {
            (MappingKey::RseScope, Some(scope)) => format!("{}-{}", rse, scope),
            _ => rse.to_string(),
        }
    }

    /// Replace the Rucio prefix of `url` with the filesystem prefix for `key`.
    ///
    /// A URL that does not start with the Rucio prefix is returned unchanged.
    pub fn rewrite(&self, key: &str, url: &str) -> Result<String, EntryError> {
        let mapping = self
            .mappings
            .get(key)
            .ok_or_else(|| EntryError::MissingMapping {
                key: key.to_string(),
            })?;

        Ok(match url.strip_prefix(mapping.rucio_prefix.as_str()) {
            Some(rest) => format!("{}{}", mapping.fs_prefix, rest),
            None => url.to_string(),
        })
    }

    /// Configured mapping keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.mappings.keys().map(String::as_str)
    }
}
