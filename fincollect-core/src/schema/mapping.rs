//! Per-provider field mappings from canonical field names to provider keys.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

use super::contract::SchemaContract;
use crate::domain::{DatasetType, FieldValue, RawRecord};

#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("{provider}/{dataset_type}: '{field}' is not a field of the contract")]
    UnknownCanonicalField {
        provider: String,
        dataset_type: DatasetType,
        field: String,
    },

    #[error("{provider}/{dataset_type}: empty provider key for '{field}'")]
    EmptyProviderKey {
        provider: String,
        dataset_type: DatasetType,
        field: String,
    },

    #[error("{provider}/{dataset_type}: provider key '{key}' mapped to both '{first}' and '{second}'")]
    DuplicateProviderKey {
        provider: String,
        dataset_type: DatasetType,
        key: String,
        first: String,
        second: String,
    },

    #[error("{provider}/{dataset_type}: required field '{field}' has no mapping")]
    UnmappedRequiredField {
        provider: String,
        dataset_type: DatasetType,
        field: String,
    },
}

/// Canonical field name -> provider key.
///
/// With `passthrough` set, canonical names without an entry are looked up verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default = "default_passthrough")]
    pub passthrough: bool,
}

fn default_passthrough() -> bool {
    true
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self::identity()
    }
}

impl FieldMapping {
    /// Every canonical name maps to itself.
    pub fn identity() -> Self {
        Self {
            fields: BTreeMap::new(),
            passthrough: true,
        }
    }

    pub fn with_field(mut self, canonical: &str, provider_key: &str) -> Self {
        self.fields
            .insert(canonical.to_string(), provider_key.to_string());
        self
    }

    /// Provider key for a canonical field, if the mapping covers it.
    pub fn resolve<'a>(&'a self, canonical: &'a str) -> Option<&'a str> {
        match self.fields.get(canonical) {
            Some(key) => Some(key.as_str()),
            None if self.passthrough => Some(canonical),
            None => None,
        }
    }

    /// Look up a canonical field in a raw record.
    pub fn lookup<'r>(&self, record: &'r RawRecord, canonical: &str) -> Option<&'r FieldValue> {
        self.resolve(canonical).and_then(|key| record.get(key))
    }

    /// Check the mapping against a compiled contract.
    pub fn check(
        &self,
        provider: &str,
        contract: &SchemaContract,
    ) -> Result<(), MappingError> {
        let dataset_type = contract.dataset_type();
        let mut seen: HashMap<&str, &str> = HashMap::new();

        for (canonical, key) in &self.fields {
            if contract.field(canonical).is_none() {
                return Err(MappingError::UnknownCanonicalField {
                    provider: provider.to_string(),
                    dataset_type,
                    field: canonical.clone(),
                });
            }
            if key.trim().is_empty() {
                return Err(MappingError::EmptyProviderKey {
                    provider: provider.to_string(),
                    dataset_type,
                    field: canonical.clone(),
                });
            }
            if let Some(first) = seen.insert(key.as_str(), canonical.as_str()) {
                return Err(MappingError::DuplicateProviderKey {
                    provider: provider.to_string(),
                    dataset_type,
                    key: key.clone(),
                    first: first.to_string(),
                    second: canonical.clone(),
                });
            }
        }

        if !self.passthrough {
            let mapped: HashSet<&str> = self.fields.keys().map(String::as_str).collect();
            if let Some(missing) = contract
                .required_fields()
                .find(|f| !mapped.contains(f.name.as_str()))
            {
                return Err(MappingError::UnmappedRequiredField {
                    provider: provider.to_string(),
                    dataset_type,
                    field: missing.name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Typed mapping table keyed by `(provider, dataset_type)`.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: HashMap<(String, DatasetType), FieldMapping>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping after checking it against the contract.
    pub fn insert(
        &mut self,
        provider: &str,
        contract: &SchemaContract,
        mapping: FieldMapping,
    ) -> Result<(), MappingError> {
        mapping.check(provider, contract)?;
        self.entries
            .insert((provider.to_string(), contract.dataset_type()), mapping);
        Ok(())
    }

    /// Mapping for a provider and dataset type; identity when none was registered.
    pub fn get(&self, provider: &str, dataset_type: DatasetType) -> FieldMapping {
        self.entries
            .get(&(provider.to_string(), dataset_type))
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
