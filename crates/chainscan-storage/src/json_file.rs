//! JSON file snapshot backend.
//!
//! All categories live in one file as `{ category: { key: value } }`.
//! A write re-reads the file, replaces only the caller's category, and
//! renames a temp file into place so a crash never leaves a half-written
//! snapshot behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use chainscan_core::snapshot::{KeyedSnapshotStore, Snapshot};
use chainscan_core::ScanError;

/// File-backed snapshot store.
pub struct JsonFileSnapshots {
    path: PathBuf,
}

impl JsonFileSnapshots {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file. A missing file is an empty store; malformed
    /// content is a storage error for the caller to decide on.
    async fn read_all(&self) -> Result<serde_json::Map<String, Value>, ScanError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(serde_json::Map::new())
            }
            Err(e) => {
                return Err(ScanError::Storage(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        if bytes.is_empty() {
            return Ok(serde_json::Map::new());
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(ScanError::Storage(format!(
                "{} holds {} instead of an object",
                self.path.display(),
                kind_of(&other)
            ))),
            Err(e) => Err(ScanError::Storage(format!(
                "parsing {}: {e}",
                self.path.display()
            ))),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl KeyedSnapshotStore for JsonFileSnapshots {
    async fn load(&self, category: &str) -> Result<Snapshot, ScanError> {
        let all = self.read_all().await?;
        match all.get(category) {
            None => Ok(Snapshot::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(ScanError::Storage(format!(
                "category {category:?} holds {} instead of an object",
                kind_of(other)
            ))),
        }
    }

    async fn store(&self, category: &str, snapshot: Snapshot) -> Result<(), ScanError> {
        // Other categories must survive the rewrite, so a file we cannot
        // parse is a write failure here, not an empty-store condition.
        let mut all = self.read_all().await?;
        all.insert(category.to_string(), Value::Object(snapshot));

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    ScanError::Storage(format!("creating {}: {e}", dir.display()))
                })?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&Value::Object(all))
            .map_err(|e| ScanError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ScanError::Storage(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ScanError::Storage(format!("renaming into {}: {e}", self.path.display())))?;
        tracing::debug!(path = %self.path.display(), category, bytes = bytes.len(), "snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &tempfile::TempDir) -> JsonFileSnapshots {
        JsonFileSnapshots::new(dir.path().join("chainscan.json"))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.load("locators").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn roundtrip_preserves_other_categories() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut locators = Snapshot::new();
        locators.insert("addr".into(), json!({"heights": [5]}));
        store.store("locators", locators).await.unwrap();

        let mut checkpoints = Snapshot::new();
        checkpoints.insert("9".into(), json!("h9"));
        store.store("checkpoints", checkpoints).await.unwrap();

        // Rewriting one category leaves the other intact
        let mut locators = Snapshot::new();
        locators.insert("addr2".into(), json!({"heights": []}));
        store.store("locators", locators).await.unwrap();

        let loaded = store.load("checkpoints").await.unwrap();
        assert_eq!(loaded.get("9").unwrap(), &json!("h9"));
        let loaded = store.load("locators").await.unwrap();
        assert!(loaded.contains_key("addr2"));
        assert!(!loaded.contains_key("addr"));
    }

    #[tokio::test]
    async fn reopening_reads_persisted_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store_in(&dir);
            let mut snap = Snapshot::new();
            snap.insert("k".into(), json!(1));
            store.store("cat", snap).await.unwrap();
        }
        let store = store_in(&dir);
        assert_eq!(store.load("cat").await.unwrap().get("k").unwrap(), &json!(1));
    }

    #[tokio::test]
    async fn corrupt_file_is_a_read_error_and_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        tokio::fs::write(store.path(), b"{not json").await.unwrap();

        assert!(matches!(
            store.load("locators").await.unwrap_err(),
            ScanError::Storage(_)
        ));
        // A write must not clobber a file it cannot merge with
        let err = store.store("locators", Snapshot::new()).await.unwrap_err();
        assert!(matches!(err, ScanError::Storage(_)));
        assert_eq!(tokio::fs::read(store.path()).await.unwrap(), b"{not json");
    }

    #[tokio::test]
    async fn parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSnapshots::new(dir.path().join("deep/nested/chainscan.json"));
        store.store("cat", Snapshot::new()).await.unwrap();
        assert!(store.path().exists());
    }
}
