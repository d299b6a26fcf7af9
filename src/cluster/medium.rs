//! Medium catalog.

use crate::error::{ReplicatorError, Result};
use crate::types::{MediumIndex, MAX_MEDIUM_COUNT};
use serde::{Deserialize, Serialize};

/// A storage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medium {
    pub index: MediumIndex,
    pub name: String,
    /// Chunk cache media are ignored by the replicator.
    pub cache: bool,
    /// Data on transient media may vanish without a node failure.
    pub transient: bool,
}

impl Medium {
    pub fn new(index: MediumIndex, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            cache: false,
            transient: false,
        }
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }
}

/// Registered media, iterated in registration order.
#[derive(Debug, Clone, Default)]
pub struct MediumCatalog {
    media: Vec<Medium>,
}

impl MediumCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a medium. Indexes must be unique and below the medium cap.
    pub fn register(&mut self, medium: Medium) -> Result<()> {
        if medium.index >= MAX_MEDIUM_COUNT {
            return Err(ReplicatorError::InvalidArgument(format!(
                "medium index {} exceeds limit {}",
                medium.index, MAX_MEDIUM_COUNT
            )));
        }
        if self.get(medium.index).is_some() {
            return Err(ReplicatorError::AlreadyExists(format!(
                "medium {}",
                medium.index
            )));
        }
        self.media.push(medium);
        Ok(())
    }

    pub fn get(&self, index: MediumIndex) -> Option<&Medium> {
        self.media.iter().find(|m| m.index == index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Medium> {
        self.media.iter().find(|m| m.name == name)
    }

    /// All media in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Medium> {
        self.media.iter()
    }

    /// Non-cache media in registration order.
    pub fn store_media(&self) -> impl Iterator<Item = &Medium> {
        self.media.iter().filter(|m| !m.cache)
    }

    pub fn is_cache(&self, index: MediumIndex) -> bool {
        self.get(index).map_or(false, |m| m.cache)
    }

    pub fn len(&self) -> usize {
        self.media.len()
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_order_is_kept() {
        let mut catalog = MediumCatalog::new();
        catalog.register(Medium::new(3, "ssd")).unwrap();
        catalog.register(Medium::new(0, "default")).unwrap();
        catalog
            .register(Medium::new(1, "cache").with_cache(true))
            .unwrap();

        let order: Vec<_> = catalog.iter().map(|m| m.index).collect();
        assert_eq!(order, vec![3, 0, 1]);
        let stores: Vec<_> = catalog.store_media().map(|m| m.name.as_str()).collect();
        assert_eq!(stores, vec!["ssd", "default"]);
        assert!(catalog.is_cache(1));
        assert_eq!(catalog.find_by_name("ssd").map(|m| m.index), Some(3));
    }

    #[test]
    fn test_rejects_duplicates_and_out_of_range() {
        let mut catalog = MediumCatalog::new();
        catalog.register(Medium::new(0, "default")).unwrap();
        assert!(catalog.register(Medium::new(0, "other")).is_err());
        assert!(catalog.register(Medium::new(MAX_MEDIUM_COUNT, "x")).is_err());
        assert_eq!(catalog.len(), 1);
    }
}
