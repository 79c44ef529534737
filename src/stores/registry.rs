use std::collections::BTreeMap;
use std::sync::Arc;

use super::selector::SelectorStore;
use super::traits::StoreAutomation;
use crate::config::StoreConfig;
use crate::error::{CartwatchError, Result};

/// Builds the automation for one configured store
pub type StoreFactory = fn(&StoreConfig) -> Result<Arc<dyn StoreAutomation>>;

/// Maps a store kind to its automation factory.
///
/// Lookups happen while validating the configuration, so a misspelled store
/// fails at startup instead of being skipped.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    factories: BTreeMap<String, StoreFactory>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every store kind shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("amazon", SelectorStore::amazon);
        registry.register("custom", SelectorStore::custom);
        registry
    }

    pub fn register(&mut self, kind: &str, factory: StoreFactory) {
        self.factories.insert(kind.trim().to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(&kind.trim().to_ascii_lowercase())
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Create the automation for a configured store
    pub fn build(&self, config: &StoreConfig) -> Result<Arc<dyn StoreAutomation>> {
        let kind = config.kind();
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| CartwatchError::UnknownStore {
                kind: kind.clone(),
                registered: self.kinds().join(", "),
            })?;
        factory(config)
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
