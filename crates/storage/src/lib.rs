pub mod error;
pub mod file;
pub mod memory;

use std::sync::Arc;

use serde_json::Value;

pub use error::{StorageError, StorageResult};
pub use file::{DEFAULT_STORE_FILE_NAME, JsonFileStore};
pub use memory::MemoryStore;

/// Durable key-value storage of whole JSON documents.
///
/// `put` replaces the value under `key` in one step; there are no partial updates.
pub trait KeyValueStore: Send + Sync {
    fn put(&self, key: &str, value: Value) -> StorageResult<()>;
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;
}

impl<T> KeyValueStore for Arc<T>
where
    T: KeyValueStore + ?Sized,
{
    fn put(&self, key: &str, value: Value) -> StorageResult<()> {
        (**self).put(key, value)
    }

    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        (**self).get(key)
    }
}
