//! Keyed snapshot persistence — the narrow interface the typed stores sit on.
//!
//! One backing store holds several unrelated categories (locators,
//! checkpoints, …) as independent `key → JSON value` maps. Categories are
//! loaded and written as whole snapshots: read-modify-write, no partial
//! updates.

use async_trait::async_trait;

use crate::error::ScanError;

/// Category name for the per-address locator cache.
pub const LOCATOR_CATEGORY: &str = "locators";
/// Category name for the height→hash checkpoint set.
pub const CHECKPOINT_CATEGORY: &str = "checkpoints";

/// One category's persisted content: a flat `key → JSON value` map.
pub type Snapshot = serde_json::Map<String, serde_json::Value>;

/// Trait for loading and storing category snapshots.
///
/// Implementations include `MemorySnapshots` (below) and the JSON file
/// backend in `chainscan-storage`.
#[async_trait]
pub trait KeyedSnapshotStore: Send + Sync {
    /// Load a category's snapshot. A category that was never written
    /// loads as an empty map, not an error.
    async fn load(&self, category: &str) -> Result<Snapshot, ScanError>;

    /// Replace a category's snapshot wholesale. Other categories in the
    /// same backing store are untouched.
    async fn store(&self, category: &str, snapshot: Snapshot) -> Result<(), ScanError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory snapshot store for tests and ephemeral runs.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemorySnapshots {
    categories: Mutex<HashMap<String, Snapshot>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedSnapshotStore for MemorySnapshots {
    async fn load(&self, category: &str) -> Result<Snapshot, ScanError> {
        Ok(self
            .categories
            .lock()
            .unwrap()
            .get(category)
            .cloned()
            .unwrap_or_default())
    }

    async fn store(&self, category: &str, snapshot: Snapshot) -> Result<(), ScanError> {
        self.categories
            .lock()
            .unwrap()
            .insert(category.to_string(), snapshot);
        Ok(())
    }
}
