//! Persisted A/B test variant assignments.

use crate::error::Result;
use crate::storage::{Repository, TESTS_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Assignment for one test: a variant index, or excluded from the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Index(u32),
    /// Stored as `false`.
    Excluded,
}

impl Variant {
    pub fn index(&self) -> Option<u32> {
        match self {
            Variant::Index(i) => Some(*i),
            Variant::Excluded => None,
        }
    }
}

impl Serialize for Variant {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Variant::Index(i) => serializer.serialize_u32(*i),
            Variant::Excluded => serializer.serialize_bool(false),
        }
    }
}

impl<'de> Deserialize<'de> for Variant {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Stored {
            Index(u32),
            Flag(bool),
        }

        match Stored::deserialize(deserializer)? {
            Stored::Index(i) => Ok(Variant::Index(i)),
            Stored::Flag(false) => Ok(Variant::Excluded),
            Stored::Flag(true) => Err(serde::de::Error::custom("expected a variant index or false")),
        }
    }
}

/// `{testId: variantIndex|false}` backed by the local store.
#[derive(Debug, Clone)]
pub struct TestVariants {
    repository: Repository,
}

impl TestVariants {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    fn load(&self) -> BTreeMap<String, Variant> {
        self.repository.get(TESTS_KEY).unwrap_or_default()
    }

    pub fn get(&self, test_id: &str) -> Option<Variant> {
        self.load().get(test_id).copied()
    }

    pub fn set(&self, test_id: impl Into<String>, variant: Variant) -> Result<()> {
        let mut variants = self.load();
        variants.insert(test_id.into(), variant);
        self.repository.set(TESTS_KEY, &variants)
    }

    pub fn all(&self) -> BTreeMap<String, Variant> {
        self.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    #[test]
    fn test_round_trip_through_storage_format() {
        let store = Arc::new(MemoryStorage::new());
        let variants = TestVariants::new(Repository::new(store.clone()));

        variants.set("title_12", Variant::Index(1)).unwrap();
        variants.set("title_13", Variant::Excluded).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&store.get_item(TESTS_KEY).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"title_12": 1, "title_13": false}));

        assert_eq!(variants.get("title_12").and_then(|v| v.index()), Some(1));
        assert_eq!(variants.get("title_13"), Some(Variant::Excluded));
        assert_eq!(variants.get("missing"), None);
    }

    #[test]
    fn test_corrupt_map_starts_empty() {
        let store = Arc::new(MemoryStorage::new());
        store.set_item(TESTS_KEY, "[1,".into());
        let variants = TestVariants::new(Repository::new(store));

        assert!(variants.all().is_empty());
    }
}
