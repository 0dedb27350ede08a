use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use snafu::OptionExt;

use super::KeyValueStore;
use super::error::{LockPoisonedSnafu, StorageResult};

/// Process-local store with nothing on disk; the engine tests run against it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: impl Into<String>, value: Value) -> Self {
        let store = Self::default();
        if let Ok(mut entries) = store.entries.lock() {
            entries.insert(key.into(), value);
        }
        store
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, key: &str, value: Value) -> StorageResult<()> {
        let mut entries = self
            .entries
            .lock()
            .ok()
            .context(LockPoisonedSnafu { stage: "memory-put" })?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let entries = self
            .entries
            .lock()
            .ok()
            .context(LockPoisonedSnafu { stage: "memory-get" })?;
        Ok(entries.get(key).cloned())
    }
}
