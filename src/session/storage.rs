//! Key-value persistence for session membership.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Namespaces of the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    JobSession,
    ReservationSession,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::JobSession => "job_session",
            KeyType::ReservationSession => "reservation_session",
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dictionary with durable put/get/list, used by the session manager.
#[async_trait]
pub trait Storer: Send + Sync {
    /// Prepare the store for use. Safe to call more than once.
    async fn init(&self) -> Result<(), StoreError>;

    async fn put(&self, key_type: KeyType, key: &str, value: &str) -> Result<(), StoreError>;

    /// Value stored under `key`, [`StoreError::NotFound`] if absent.
    async fn get(&self, key_type: KeyType, key: &str) -> Result<String, StoreError>;

    /// All keys of a type in ascending order.
    async fn list(&self, key_type: KeyType) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key_type: KeyType, key: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key_type: KeyType, key: &str) -> Result<(), StoreError>;

    /// Release the store. Later calls fail with [`StoreError::Closed`].
    async fn exit(&self) -> Result<(), StoreError>;
}

/// Non-durable store for process-local sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<KeyType, BTreeMap<String, String>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Storer for MemoryStore {
    async fn init(&self) -> Result<(), StoreError> {
        self.check_open()
    }

    async fn put(&self, key_type: KeyType, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key_type)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key_type: KeyType, key: &str) -> Result<String, StoreError> {
        self.check_open()?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&key_type)
            .and_then(|m| m.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key_type: key_type.to_string(),
                key: key.to_string(),
            })
    }

    async fn list(&self, key_type: KeyType) -> Result<Vec<String>, StoreError> {
        self.check_open()?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(&key_type)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn exists(&self, key_type: KeyType, key: &str) -> Result<bool, StoreError> {
        self.check_open()?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(&key_type).is_some_and(|m| m.contains_key(key)))
    }

    async fn delete(&self, key_type: KeyType, key: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(m) = entries.get_mut(&key_type) {
            m.remove(key);
        }
        Ok(())
    }

    async fn exit(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
