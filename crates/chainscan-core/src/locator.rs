//! Per-address locator cache — which heights were relevant for an address,
//! and how far the chain has been checked on its behalf.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::snapshot::{KeyedSnapshotStore, Snapshot, LOCATOR_CATEGORY};

/// The cache record for one tracked address.
///
/// Field names mirror the persisted JSON shape; optional fields are omitted
/// at their defaults, so an address absent from the snapshot reads back as
/// `Locator::default()` (never cached).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Locator {
    /// Heights at which this address appeared — strictly increasing, unique.
    #[serde(default)]
    pub heights: Vec<u64>,
    /// Hash of the last checked block.
    #[serde(rename = "lastblock", default, skip_serializing_if = "Option::is_none")]
    pub last_block: Option<String>,
    /// Height through which the chain has been checked, gap-free, for this
    /// address; `None` until a first block has been checked, which keeps
    /// "never checked" distinct from "checked through height 0".
    /// Monotonically non-decreasing unless explicitly reset.
    #[serde(rename = "lastblockheight", default, skip_serializing_if = "Option::is_none")]
    pub last_block_height: Option<u64>,
    /// Explicit floor of the cached window (0 unless force-started).
    #[serde(rename = "startheight", default, skip_serializing_if = "is_zero")]
    pub start_height: u64,
    /// Set when a scan was accepted that started above `lastblockheight + 1`,
    /// leaving a known gap in the cached window.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub discontinuous: bool,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Locator {
    /// Returns `true` if `height` is already cached for this address.
    pub fn contains_height(&self, height: u64) -> bool {
        self.heights.binary_search(&height).is_ok()
    }

    fn merge_heights(&mut self, new_heights: &[u64]) {
        self.heights.extend_from_slice(new_heights);
        self.heights.sort_unstable();
        self.heights.dedup();
    }
}

/// The persisted map of `address → Locator`, held as one snapshot.
///
/// Mutations act on the in-memory map; `store()` persists the whole
/// snapshot. Concurrent writers from multiple processes are unsupported by
/// design — callers serialize access.
pub struct LocatorStore {
    snapshots: Arc<dyn KeyedSnapshotStore>,
    records: BTreeMap<String, Locator>,
}

impl LocatorStore {
    /// Load the locator snapshot. Missing or unreadable data degrades to an
    /// empty store with a warning; a single malformed record is skipped.
    pub async fn load(snapshots: Arc<dyn KeyedSnapshotStore>) -> Self {
        let raw = match snapshots.load(LOCATOR_CATEGORY).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "locator snapshot unreadable — starting empty");
                Snapshot::new()
            }
        };
        let mut records = BTreeMap::new();
        for (address, value) in raw {
            match serde_json::from_value::<Locator>(value) {
                Ok(mut locator) => {
                    // Repair ordering on the way in; the invariant is ours to hold.
                    locator.heights.sort_unstable();
                    locator.heights.dedup();
                    records.insert(address, locator);
                }
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "skipping malformed locator record");
                }
            }
        }
        Self { snapshots, records }
    }

    /// The record for `address`, or an empty default if unseen.
    pub fn get(&self, address: &str) -> Locator {
        self.records.get(address).cloned().unwrap_or_default()
    }

    /// Returns `true` if `address` has a record.
    pub fn contains(&self, address: &str) -> bool {
        self.records.contains_key(address)
    }

    /// All records, ordered by address.
    pub fn all(&self) -> &BTreeMap<String, Locator> {
        &self.records
    }

    /// Merge newly discovered `new_heights` and advance the checked boundary
    /// for `address`. Creates the record if unseen.
    ///
    /// A `last_height` below the stored boundary is ignored (logged, not an
    /// error), which makes the call idempotent and keeps the boundary
    /// monotonic. `scan_start` is the height the producing scan began at:
    /// starting past the first unchecked height marks the record
    /// discontinuous; starting at or below the record's floor heals the
    /// flag, since the whole claimed window was re-covered.
    ///
    /// Returns `true` if the update was applied.
    pub fn update_heights(
        &mut self,
        address: &str,
        new_heights: &[u64],
        last_height: u64,
        last_hash: &str,
        scan_start: u64,
    ) -> bool {
        match self.records.get_mut(address) {
            Some(rec) => {
                if let Some(stored) = rec.last_block_height {
                    if last_height < stored {
                        tracing::warn!(
                            address,
                            stored,
                            given = last_height,
                            "ignoring stale locator update"
                        );
                        return false;
                    }
                }
                // The unchecked region begins right past the boundary, or at
                // the window floor when nothing was ever checked.
                let next_unchecked = rec
                    .last_block_height
                    .map_or(rec.start_height, |checked| checked + 1);
                if scan_start > next_unchecked {
                    tracing::warn!(
                        address,
                        scan_start,
                        next_unchecked,
                        "scan left a gap — marking locator discontinuous"
                    );
                    rec.discontinuous = true;
                } else if scan_start <= rec.start_height {
                    rec.discontinuous = false;
                }
                rec.merge_heights(new_heights);
                rec.last_block_height = Some(last_height);
                rec.last_block = Some(last_hash.to_string());
                true
            }
            None => {
                // First sighting: the record claims exactly the scanned window.
                let mut rec = Locator {
                    start_height: scan_start,
                    last_block_height: Some(last_height),
                    last_block: Some(last_hash.to_string()),
                    ..Default::default()
                };
                rec.merge_heights(new_heights);
                self.records.insert(address.to_string(), rec);
                true
            }
        }
    }

    /// Reset `address` to an empty record whose window starts at `height`,
    /// discarding any cached data. The next scan from `height` extends the
    /// boundary without a gap; at height 0 nothing counts as checked yet.
    pub fn force_start(&mut self, address: &str, height: u64) {
        tracing::info!(address, height, "force-starting locator");
        self.records.insert(
            address.to_string(),
            Locator {
                start_height: height,
                last_block_height: height.checked_sub(1),
                ..Default::default()
            },
        );
    }

    /// Remove the record for `address`. Returns `true` if one existed.
    pub fn erase(&mut self, address: &str) -> bool {
        self.records.remove(address).is_some()
    }

    /// Drop cached heights above `cutoff` for every address, clamping checked
    /// boundaries down to it. Used after a detected reorg: everything above
    /// the cutoff must be re-verified, so clamped records also lose their
    /// stale block hash.
    ///
    /// Returns the number of heights dropped.
    pub fn prune_orphans(&mut self, cutoff: u64) -> usize {
        let mut dropped = 0;
        for (address, rec) in &mut self.records {
            let before = rec.heights.len();
            rec.heights.retain(|h| *h <= cutoff);
            dropped += before - rec.heights.len();
            if let Some(checked) = rec.last_block_height {
                if checked > cutoff {
                    tracing::info!(
                        address = %address,
                        from = checked,
                        to = cutoff,
                        "clamping locator boundary below reorg cutoff"
                    );
                    rec.last_block_height = Some(cutoff);
                    rec.last_block = None;
                }
            }
        }
        dropped
    }

    /// Persist the full snapshot. Write failures propagate.
    pub async fn store(&self) -> Result<(), ScanError> {
        let mut snapshot = Snapshot::new();
        for (address, locator) in &self.records {
            let value = serde_json::to_value(locator)
                .map_err(|e| ScanError::Storage(format!("locator for {address}: {e}")))?;
            snapshot.insert(address.clone(), value);
        }
        self.snapshots.store(LOCATOR_CATEGORY, snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshots;
    use serde_json::json;

    async fn empty_store() -> LocatorStore {
        LocatorStore::load(Arc::new(MemorySnapshots::new())).await
    }

    #[tokio::test]
    async fn unseen_address_reads_as_default() {
        let store = empty_store().await;
        let rec = store.get("addr1");
        assert!(rec.heights.is_empty());
        assert!(rec.last_block_height.is_none());
        assert!(!store.contains("addr1"));
    }

    #[tokio::test]
    async fn updates_merge_sorted_unique() {
        let mut store = empty_store().await;
        assert!(store.update_heights("a", &[5, 3], 10, "h10", 0));
        assert!(store.update_heights("a", &[3, 7], 20, "h20", 11));

        let rec = store.get("a");
        assert_eq!(rec.heights, vec![3, 5, 7]);
        assert_eq!(rec.last_block_height, Some(20));
        assert_eq!(rec.last_block.as_deref(), Some("h20"));
        assert!(!rec.discontinuous);
    }

    #[tokio::test]
    async fn stale_update_is_ignored() {
        let mut store = empty_store().await;
        store.update_heights("a", &[5], 100, "h100", 0);
        assert!(!store.update_heights("a", &[50], 40, "h40", 0));

        let rec = store.get("a");
        assert_eq!(rec.heights, vec![5]);
        assert_eq!(rec.last_block_height, Some(100));
        assert_eq!(rec.last_block.as_deref(), Some("h100"));
    }

    #[tokio::test]
    async fn repeated_update_is_idempotent() {
        let mut store = empty_store().await;
        store.update_heights("a", &[5, 9], 10, "h10", 0);
        store.update_heights("a", &[5, 9], 10, "h10", 0);

        let rec = store.get("a");
        assert_eq!(rec.heights, vec![5, 9]);
        assert_eq!(rec.last_block_height, Some(10));
    }

    #[tokio::test]
    async fn gap_sets_discontinuous_and_floor_rescan_heals() {
        let mut store = empty_store().await;
        store.update_heights("a", &[], 10, "h10", 0);
        // Jumping to 50 leaves [11, 49] unchecked
        store.update_heights("a", &[60], 70, "h70", 50);
        assert!(store.get("a").discontinuous);

        // An intermediate rescan does not touch the flag…
        store.update_heights("a", &[], 80, "h80", 40);
        assert!(store.get("a").discontinuous);

        // …but re-covering the whole window from the floor does
        store.update_heights("a", &[], 90, "h90", 0);
        assert!(!store.get("a").discontinuous);
    }

    #[tokio::test]
    async fn force_start_realigns_window() {
        let mut store = empty_store().await;
        store.update_heights("y", &[5, 9], 10, "h10", 0);
        store.force_start("y", 1000);

        let rec = store.get("y");
        assert!(rec.heights.is_empty());
        assert_eq!(rec.start_height, 1000);
        assert_eq!(rec.last_block_height, Some(999));
        assert!(rec.last_block.is_none());

        // A scan starting at the new floor extends without a gap
        store.update_heights("y", &[1050], 1050, "h1050", 1000);
        let rec = store.get("y");
        assert_eq!(rec.start_height, 1000);
        assert_eq!(rec.heights, vec![1050]);
        assert!(!rec.discontinuous);
    }

    #[tokio::test]
    async fn force_start_at_genesis_leaves_block_zero_unchecked() {
        let mut store = empty_store().await;
        store.force_start("a", 0);

        let rec = store.get("a");
        assert_eq!(rec.start_height, 0);
        // Nothing has been checked yet, so block 0 is still pending.
        assert!(rec.last_block_height.is_none());

        // A scan covering block 0 then records it normally.
        assert!(store.update_heights("a", &[0], 3, "h3", 0));
        let rec = store.get("a");
        assert_eq!(rec.heights, vec![0]);
        assert_eq!(rec.last_block_height, Some(3));
        assert!(!rec.discontinuous);
    }

    #[tokio::test]
    async fn prune_orphans_drops_heights_and_clamps() {
        let mut store = empty_store().await;
        store.update_heights("a", &[3, 9, 12], 15, "h15", 0);
        store.update_heights("b", &[2], 5, "h5", 0);

        let dropped = store.prune_orphans(8);
        assert_eq!(dropped, 2);

        let a = store.get("a");
        assert_eq!(a.heights, vec![3]);
        assert_eq!(a.last_block_height, Some(8));
        assert!(a.last_block.is_none());

        // Records already below the cutoff are untouched
        let b = store.get("b");
        assert_eq!(b.heights, vec![2]);
        assert_eq!(b.last_block_height, Some(5));
        assert_eq!(b.last_block.as_deref(), Some("h5"));
    }

    #[tokio::test]
    async fn erase_removes_record() {
        let mut store = empty_store().await;
        store.update_heights("a", &[1], 1, "h1", 0);
        assert!(store.erase("a"));
        assert!(!store.erase("a"));
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let snapshots = Arc::new(MemorySnapshots::new());
        let mut store = LocatorStore::load(snapshots.clone()).await;
        store.update_heights("a", &[5], 10, "h10", 0);
        store.force_start("y", 1000);
        store.store().await.unwrap();

        let reloaded = LocatorStore::load(snapshots).await;
        assert_eq!(reloaded.get("a"), store.get("a"));
        assert_eq!(reloaded.get("y"), store.get("y"));
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_on_load() {
        let snapshots = Arc::new(MemorySnapshots::new());
        let mut raw = Snapshot::new();
        raw.insert("good".into(), json!({"heights": [2, 1], "lastblockheight": 3}));
        raw.insert("bad".into(), json!("not a record"));
        snapshots.store(LOCATOR_CATEGORY, raw).await.unwrap();

        let store = LocatorStore::load(snapshots).await;
        assert!(store.contains("good"));
        assert!(!store.contains("bad"));
        // Ordering repaired on load
        assert_eq!(store.get("good").heights, vec![1, 2]);
    }

    #[test]
    fn persisted_shape_omits_defaults() {
        let locator = Locator {
            heights: vec![5],
            last_block: Some("h10".into()),
            last_block_height: Some(10),
            ..Default::default()
        };
        let value = serde_json::to_value(&locator).unwrap();
        assert_eq!(
            value,
            json!({"heights": [5], "lastblock": "h10", "lastblockheight": 10})
        );
    }
}
