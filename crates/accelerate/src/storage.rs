//! Persisted client-side state.
//!
//! The host provides a [`Storage`] implementation over whatever key/value
//! store the platform offers. [`Repository`] layers typed JSON access on top
//! of it and is the only place that deals with corrupt stored data.

use crate::error::Result;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Storage key for the visitor identity.
pub const USER_ID_KEY: &str = "Accelerate.UserId";

/// Storage key for the browser session identifier (session-scoped store).
pub const SESSION_ID_KEY: &str = "Accelerate.SessionId";

/// Storage key for experiment variant assignments.
pub const TESTS_KEY: &str = "Accelerate.Tests";

/// Storage key for the endpoint belonging to `user_id`.
pub fn endpoint_key(user_id: &str) -> String {
    format!("Accelerate.Endpoint.{}", user_id)
}

/// A synchronous string key/value store.
pub trait Storage: Send + Sync {
    /// Read the raw value stored under `key`.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Store a raw value under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: String);

    /// Remove `key` from the store.
    fn remove_item(&self, key: &str);
}

/// In-memory storage. Used when the host does not provide one.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: String) {
        self.items.write().insert(key.to_string(), value);
    }

    fn remove_item(&self, key: &str) {
        self.items.write().remove(key);
    }
}

/// Typed JSON repository over a [`Storage`].
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn Storage>,
}

impl Repository {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    /// Read and decode `key`. Missing and undecodable values both yield `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.store.get_item(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "ignoring corrupt stored value");
                None
            }
        }
    }

    /// Encode and store `value` under `key`.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set_item(key, raw);
        Ok(())
    }

    #[cfg(test)]
    pub fn remove(&self, key: &str) {
        self.store.remove_item(key);
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repository() -> (Arc<MemoryStorage>, Repository) {
        let store = Arc::new(MemoryStorage::new());
        let repo = Repository::new(store.clone());
        (store, repo)
    }

    #[test]
    fn test_set_and_get() {
        let (_, repo) = repository();
        repo.set("key", &json!({"a": [1, 2]})).unwrap();

        let value: serde_json::Value = repo.get("key").unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_missing_key_is_none() {
        let (_, repo) = repository();
        assert!(repo.get::<String>("missing").is_none());
    }

    #[test]
    fn test_corrupt_json_is_none() {
        let (store, repo) = repository();
        store.set_item("key", "{not json".into());

        assert!(repo.get::<serde_json::Value>("key").is_none());
    }

    #[test]
    fn test_remove() {
        let (store, repo) = repository();
        repo.set("key", &"value").unwrap();
        repo.remove("key");

        assert!(store.get_item("key").is_none());
    }

    #[test]
    fn test_endpoint_key() {
        assert_eq!(endpoint_key("abc"), "Accelerate.Endpoint.abc");
    }
}
