use std::collections::{HashMap, HashSet};

use tracing::{error, info};

use crate::error::ConfigError;
use crate::protocol::{ParameterInfo, ParameterType, Signature};

type CatalogKey = (String, ParameterType);

/// Aggregated parameter signatures of every instrument, keyed by
/// `(qualified_id, type)`. Entries are never replaced or removed.
#[derive(Debug, Default)]
pub struct ParameterCatalog {
    entries: HashMap<CatalogKey, ParameterInfo>,
}

impl ParameterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the whole batch first, then inserts it. On any malformed
    /// signature or key conflict nothing is inserted.
    pub fn register(&mut self, batch: &[ParameterInfo]) -> Result<(), ConfigError> {
        let mut seen: HashSet<CatalogKey> = HashSet::with_capacity(batch.len());

        for entry in batch {
            let qualified = entry.qualified_id();
            if let Err(e) = Signature::parse(&qualified, &entry.signature) {
                error!(id = %qualified, error = %e, "rejecting signature batch");
                return Err(e);
            }

            let key = (qualified, entry.kind);
            if self.entries.contains_key(&key) || !seen.insert(key.clone()) {
                let err = ConfigError::DuplicateParameter {
                    id: key.0,
                    kind: entry.kind.to_string(),
                };
                error!(error = %err, "rejecting signature batch");
                return Err(err);
            }
        }

        for entry in batch {
            self.entries
                .insert((entry.qualified_id(), entry.kind), entry.clone());
        }
        if let Some(first) = batch.first() {
            info!(provider = %first.provider, parameters = batch.len(), "catalog slice registered");
        }
        Ok(())
    }

    pub fn get(&self, qualified_id: &str, kind: ParameterType) -> Option<&ParameterInfo> {
        self.entries.get(&(qualified_id.to_string(), kind))
    }

    pub fn contains_id(&self, qualified_id: &str) -> bool {
        [ParameterType::Get, ParameterType::Set]
            .into_iter()
            .any(|kind| self.get(qualified_id, kind).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ParameterInfo> {
        self.entries.values()
    }
}
