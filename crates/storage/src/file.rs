use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt};

use super::KeyValueStore;
use super::error::{
    CreateStoreDirectorySnafu, LockPoisonedSnafu, NotAnObjectSnafu, ParseStoreSnafu,
    ReadStoreSnafu, RenameTempFileSnafu, SerializeStoreSnafu, StorageError, StorageResult,
    WriteStoreSnafu,
};

pub const DEFAULT_STORE_FILE_NAME: &str = "config.json";

/// One JSON object on disk, each top-level key holding one document.
///
/// Reads go to disk every time so edits made by another process are picked up.
/// Writes replace the whole file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> StorageResult<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }

        let text = std::fs::read_to_string(&self.path).context(ReadStoreSnafu {
            stage: "read-store",
            path: self.path.clone(),
        })?;
        if text.trim().is_empty() {
            return Ok(Map::new());
        }

        let value: Value = serde_json::from_str(&text).context(ParseStoreSnafu {
            stage: "parse-store",
            path: self.path.clone(),
        })?;

        match value {
            Value::Object(map) => Ok(map),
            _ => NotAnObjectSnafu {
                stage: "parse-store-root",
                path: self.path.clone(),
            }
            .fail(),
        }
    }

    fn write_document(&self, document: &Map<String, Value>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateStoreDirectorySnafu {
                stage: "create-store-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(document).context(SerializeStoreSnafu {
            stage: "serialize-store-json",
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteStoreSnafu {
            stage: "write-temporary-store-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.path).context(RenameTempFileSnafu {
            stage: "rename-temporary-store-file",
            from: temp_path,
            to: self.path.clone(),
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn put(&self, key: &str, value: Value) -> StorageResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .ok()
            .context(LockPoisonedSnafu { stage: "store-put" })?;

        let mut document = match self.read_document() {
            Ok(document) => document,
            // A corrupt file must not block every later write; start over from an empty document.
            Err(error @ (StorageError::ParseStore { .. } | StorageError::NotAnObject { .. })) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %error,
                    "store file is unreadable; replacing it"
                );
                Map::new()
            }
            Err(error) => return Err(error),
        };

        document.insert(key.to_string(), value);
        self.write_document(&document)?;
        tracing::debug!(path = %self.path.display(), key, "store document written");
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.read_document()?.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("config.json"));

        assert_eq!(store.get("chats").unwrap(), None);
    }

    #[test]
    fn put_replaces_one_key_and_keeps_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("kosmos").join("config.json"));

        store.put("theme", json!("dark")).unwrap();
        store.put("chats", json!([{"id": "a"}])).unwrap();
        store.put("chats", json!([])).unwrap();

        assert_eq!(store.get("theme").unwrap(), Some(json!("dark")));
        assert_eq!(store.get("chats").unwrap(), Some(json!([])));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_fails_reads_but_is_replaced_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonFileStore::new(&path);

        assert!(matches!(
            store.get("chats"),
            Err(StorageError::ParseStore { .. })
        ));

        store.put("chats", json!([])).unwrap();
        assert_eq!(store.get("chats").unwrap(), Some(json!([])));
    }

    #[test]
    fn non_object_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        assert!(matches!(
            JsonFileStore::new(&path).get("chats"),
            Err(StorageError::NotAnObject { .. })
        ));
    }
}
