//! Checkpoint store and reorg guard.
//!
//! A checkpoint pins a `height → block hash` pair. Before cached data is
//! trusted or new progress persisted, the newest checkpoint is compared
//! against the live chain; a mismatch means the canonical chain replaced a
//! block we had observed, and everything above the divergence point is
//! suspect.
//!
//! Per checkpoint the lifecycle is `CREATED → VALID → ORPHANED`: a stored
//! pair either keeps matching the chain or is found orphaned and deleted.
//! There is no transition back; replacements are fresh pairs at the tip.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::ChainReader;
use crate::error::ScanError;
use crate::snapshot::{KeyedSnapshotStore, Snapshot, CHECKPOINT_CATEGORY};

/// Minimum number of checkpoints pruning always leaves behind.
pub const DEFAULT_MIN_RETAINED: usize = 5;

/// A stored `(height, hash)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub hash: String,
}

/// Where a checkpoint stands against the live chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    /// Stored, not yet compared.
    Created,
    /// Compared and matching the canonical chain.
    Valid,
    /// Compared and diverged — deleted on prune.
    Orphaned,
}

impl std::fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Valid => write!(f, "valid"),
            Self::Orphaned => write!(f, "orphaned"),
        }
    }
}

/// Outcome of a reorg check that did not detect a reorg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReorgStatus {
    /// No checkpoint existed; one was created at the current tip.
    Initialized { height: u64, hash: String },
    /// The newest checkpoint matches the live chain.
    Clean { height: u64, hash: String },
}

/// Result of comparing every stored checkpoint against the live chain.
#[derive(Debug, Clone, Default)]
pub struct OrphanScan {
    /// Checkpoints that still match, ascending by height.
    pub valid: Vec<Checkpoint>,
    /// Checkpoints that diverged (or whose height no longer exists).
    pub orphaned: Vec<Checkpoint>,
}

/// Threshold for pruning old checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneThreshold {
    /// Keep the newest `n` blocks' worth: drop checkpoints more than `n`
    /// below the newest one.
    Depth(u64),
    /// Drop checkpoints below an absolute height.
    Below(u64),
}

/// The persisted, ordered set of checkpoints.
///
/// Same snapshot discipline as the locator store: mutations act on the
/// in-memory map and `store()` persists the whole category.
pub struct CheckpointStore {
    snapshots: Arc<dyn KeyedSnapshotStore>,
    entries: BTreeMap<u64, String>,
    min_retained: usize,
}

impl CheckpointStore {
    /// Load the checkpoint snapshot; unreadable data degrades to empty with
    /// a warning, malformed entries are skipped.
    pub async fn load(snapshots: Arc<dyn KeyedSnapshotStore>) -> Self {
        let raw = match snapshots.load(CHECKPOINT_CATEGORY).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint snapshot unreadable — starting empty");
                Snapshot::new()
            }
        };
        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            match (key.parse::<u64>(), value) {
                (Ok(height), Value::String(hash)) => {
                    entries.insert(height, hash);
                }
                (key, value) => {
                    tracing::warn!(?key, ?value, "skipping malformed checkpoint entry");
                }
            }
        }
        Self {
            snapshots,
            entries,
            min_retained: DEFAULT_MIN_RETAINED,
        }
    }

    /// Override the minimum retained count (tests use small chains).
    pub fn with_min_retained(mut self, min_retained: usize) -> Self {
        self.set_min_retained(min_retained);
        self
    }

    pub fn set_min_retained(&mut self, min_retained: usize) {
        self.min_retained = min_retained;
    }

    pub fn min_retained(&self) -> usize {
        self.min_retained
    }

    /// The checkpoint at `height`, if stored.
    pub fn get(&self, height: u64) -> Option<Checkpoint> {
        self.entries.get(&height).map(|hash| Checkpoint {
            height,
            hash: hash.clone(),
        })
    }

    /// The newest stored checkpoint.
    pub fn latest(&self) -> Option<Checkpoint> {
        self.entries.iter().next_back().map(|(h, hash)| Checkpoint {
            height: *h,
            hash: hash.clone(),
        })
    }

    /// All checkpoints, ascending by height.
    pub fn all(&self) -> Vec<Checkpoint> {
        self.entries
            .iter()
            .map(|(h, hash)| Checkpoint {
                height: *h,
                hash: hash.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a `(height, hash)` pair the caller already observed, pinning
    /// exactly what was scanned rather than refetching.
    pub fn insert(&mut self, height: u64, hash: &str) -> Checkpoint {
        self.entries.insert(height, hash.to_string());
        Checkpoint {
            height,
            hash: hash.to_string(),
        }
    }

    /// Record a checkpoint at `height` (current tip when `None`), fetching
    /// the hash from the chain.
    pub async fn record<C: ChainReader + ?Sized>(
        &mut self,
        chain: &C,
        height: Option<u64>,
    ) -> Result<Checkpoint, ScanError> {
        let height = match height {
            Some(h) => h,
            None => chain.height().await?,
        };
        let hash = chain.block_hash(height).await?;
        tracing::info!(height, hash = %hash, "recording checkpoint");
        self.entries.insert(height, hash.clone());
        Ok(Checkpoint { height, hash })
    }

    /// Compare the newest checkpoint against the live chain.
    ///
    /// No checkpoint yet → create one at the tip and report `Initialized`.
    /// Matching hash → `Clean`. Divergence — including a checkpointed height
    /// that no longer exists — is a `ReorgDetected` error; callers about to
    /// mutate chain state must treat it as a hard stop.
    pub async fn reorg_check<C: ChainReader + ?Sized>(
        &mut self,
        chain: &C,
    ) -> Result<ReorgStatus, ScanError> {
        let Some(cp) = self.latest() else {
            let cp = self.record(chain, None).await?;
            self.store().await?;
            tracing::info!(height = cp.height, "no checkpoint yet — initialized at tip");
            return Ok(ReorgStatus::Initialized {
                height: cp.height,
                hash: cp.hash,
            });
        };
        let actual = match chain.block_hash(cp.height).await {
            Ok(hash) => hash,
            Err(e) if e.is_not_found() => {
                // The checkpointed block no longer exists at all.
                tracing::error!(height = cp.height, "checkpointed height beyond current tip");
                return Err(ScanError::ReorgDetected {
                    height: cp.height,
                    expected: cp.hash,
                    actual: "missing".into(),
                });
            }
            Err(e) => return Err(e),
        };
        if actual == cp.hash {
            Ok(ReorgStatus::Clean {
                height: cp.height,
                hash: cp.hash,
            })
        } else {
            tracing::error!(
                height = cp.height,
                expected = %cp.hash,
                actual = %actual,
                "reorg detected"
            );
            Err(ScanError::ReorgDetected {
                height: cp.height,
                expected: cp.hash,
                actual,
            })
        }
    }

    /// Compare every stored checkpoint against the live chain without
    /// mutating anything. Fetches run concurrently; results are merged
    /// in height order.
    pub async fn scan_orphans<C: ChainReader + ?Sized>(
        &self,
        chain: &C,
    ) -> Result<OrphanScan, ScanError> {
        let pairs: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(h, hash)| (*h, hash.clone()))
            .collect();
        let fetches = pairs
            .iter()
            .map(|(height, _)| chain.block_hash(*height));
        let results = futures::future::join_all(fetches).await;

        let mut scan = OrphanScan::default();
        for ((height, stored), result) in pairs.into_iter().zip(results) {
            let cp = Checkpoint {
                height,
                hash: stored,
            };
            match result {
                Ok(actual) if actual == cp.hash => scan.valid.push(cp),
                Ok(actual) => {
                    tracing::warn!(height, expected = %cp.hash, actual = %actual, "orphaned checkpoint");
                    scan.orphaned.push(cp);
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(height, "checkpointed height no longer on chain");
                    scan.orphaned.push(cp);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(scan)
    }

    /// Delete the checkpoints named in `scan.orphaned`, reseeding from the
    /// live chain if fewer than the minimum retained count survive.
    /// Returns the reseeded checkpoints.
    pub async fn apply_orphan_prune<C: ChainReader + ?Sized>(
        &mut self,
        chain: &C,
        scan: &OrphanScan,
    ) -> Result<Vec<Checkpoint>, ScanError> {
        for cp in &scan.orphaned {
            self.entries.remove(&cp.height);
        }
        let mut reseeded = Vec::new();
        if self.entries.len() < self.min_retained {
            let tip = chain.height().await?;
            if self.entries.last_key_value().map(|(h, _)| *h) != Some(tip) {
                reseeded.push(self.record(chain, Some(tip)).await?);
            }
            if self.entries.len() < self.min_retained && tip > 0 {
                let back = tip - 1;
                if !self.entries.contains_key(&back) {
                    reseeded.push(self.record(chain, Some(back)).await?);
                }
            }
        }
        Ok(reseeded)
    }

    /// Checkpoints that `prune_old` would remove for `threshold`, oldest
    /// first. Never plans past the minimum retained count.
    pub fn plan_prune_old(&self, threshold: PruneThreshold) -> Vec<Checkpoint> {
        let Some(newest) = self.entries.keys().next_back().copied() else {
            return Vec::new();
        };
        let cutoff = match threshold {
            PruneThreshold::Depth(n) => newest.saturating_sub(n),
            PruneThreshold::Below(height) => height,
        };
        let removable = self.entries.len().saturating_sub(self.min_retained);
        self.entries
            .iter()
            .filter(|(h, _)| **h < cutoff)
            .take(removable)
            .map(|(h, hash)| Checkpoint {
                height: *h,
                hash: hash.clone(),
            })
            .collect()
    }

    /// Remove the given checkpoints from the set.
    pub fn remove(&mut self, checkpoints: &[Checkpoint]) {
        for cp in checkpoints {
            self.entries.remove(&cp.height);
        }
    }

    /// Persist the full snapshot. Write failures propagate.
    pub async fn store(&self) -> Result<(), ScanError> {
        let mut snapshot = Snapshot::new();
        for (height, hash) in &self.entries {
            snapshot.insert(height.to_string(), Value::String(hash.clone()));
        }
        self.snapshots.store(CHECKPOINT_CATEGORY, snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::snapshot::MemorySnapshots;

    async fn store_with(chain: &MemoryChain, blocks: u64) -> CheckpointStore {
        for _ in 0..blocks {
            chain.add_block(vec![]);
        }
        CheckpointStore::load(Arc::new(MemorySnapshots::new())).await
    }

    #[tokio::test]
    async fn first_check_initializes() {
        let chain = MemoryChain::new();
        let mut store = store_with(&chain, 10).await;

        let status = store.reorg_check(&chain).await.unwrap();
        assert!(matches!(status, ReorgStatus::Initialized { height: 9, .. }));
        assert_eq!(store.len(), 1);

        // Second check is clean against the same chain
        let status = store.reorg_check(&chain).await.unwrap();
        assert!(matches!(status, ReorgStatus::Clean { height: 9, .. }));
    }

    #[tokio::test]
    async fn divergence_is_reorg() {
        let chain = MemoryChain::new();
        let mut store = store_with(&chain, 10).await;
        store.record(&chain, Some(9)).await.unwrap();

        chain.invalidate(9);
        chain.add_block(vec![]);

        let err = store.reorg_check(&chain).await.unwrap_err();
        assert!(err.is_reorg());
        match err {
            ScanError::ReorgDetected { height, expected, actual } => {
                assert_eq!(height, 9);
                assert_ne!(expected, actual);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn vanished_height_is_reorg() {
        let chain = MemoryChain::new();
        let mut store = store_with(&chain, 10).await;
        store.record(&chain, Some(9)).await.unwrap();

        // The chain shrinks below the checkpointed height
        chain.invalidate(5);

        let err = store.reorg_check(&chain).await.unwrap_err();
        assert!(err.is_reorg());
    }

    #[tokio::test]
    async fn orphan_scan_separates_valid_from_orphaned() {
        let chain = MemoryChain::new();
        let mut store = store_with(&chain, 10).await;
        for h in [3, 6, 9] {
            store.record(&chain, Some(h)).await.unwrap();
        }

        chain.invalidate(8);
        for _ in 8..10 {
            chain.add_block(vec![]);
        }

        let scan = store.scan_orphans(&chain).await.unwrap();
        assert_eq!(
            scan.valid.iter().map(|c| c.height).collect::<Vec<_>>(),
            vec![3, 6]
        );
        assert_eq!(
            scan.orphaned.iter().map(|c| c.height).collect::<Vec<_>>(),
            vec![9]
        );
        // The scan itself mutates nothing
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn orphan_prune_reseeds_to_minimum() {
        let chain = MemoryChain::new();
        let mut store = store_with(&chain, 10).await;
        store = store.with_min_retained(2);
        store.record(&chain, Some(9)).await.unwrap();

        chain.invalidate(9);
        chain.add_block(vec![]);

        let scan = store.scan_orphans(&chain).await.unwrap();
        assert_eq!(scan.orphaned.len(), 1);

        let reseeded = store.apply_orphan_prune(&chain, &scan).await.unwrap();
        let heights: Vec<u64> = reseeded.iter().map(|c| c.height).collect();
        assert_eq!(heights, vec![9, 8]);
        assert_eq!(store.len(), 2);
        // The reseeded tip matches the live chain now
        assert_eq!(
            store.get(9).unwrap().hash,
            chain.block_hash(9).await.unwrap()
        );
    }

    #[tokio::test]
    async fn prune_old_preserves_minimum() {
        let chain = MemoryChain::new();
        let mut store = store_with(&chain, 20).await;
        store = store.with_min_retained(3);
        for h in [2, 5, 8, 11, 14] {
            store.record(&chain, Some(h)).await.unwrap();
        }

        // Everything below 100 is past the threshold, but only two may go
        let plan = store.plan_prune_old(PruneThreshold::Below(100));
        assert_eq!(plan.iter().map(|c| c.height).collect::<Vec<_>>(), vec![2, 5]);

        store.remove(&plan);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn prune_old_by_depth() {
        let chain = MemoryChain::new();
        let mut store = store_with(&chain, 20).await;
        store = store.with_min_retained(1);
        for h in [2, 5, 8, 11, 14] {
            store.record(&chain, Some(h)).await.unwrap();
        }

        // Depth 6 from the newest (14) → cutoff 8: drop 2 and 5
        let plan = store.plan_prune_old(PruneThreshold::Depth(6));
        assert_eq!(plan.iter().map(|c| c.height).collect::<Vec<_>>(), vec![2, 5]);
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let chain = MemoryChain::new();
        for _ in 0..5 {
            chain.add_block(vec![]);
        }
        let snapshots = Arc::new(MemorySnapshots::new());
        let mut store = CheckpointStore::load(snapshots.clone()).await;
        store.record(&chain, Some(2)).await.unwrap();
        store.record(&chain, Some(4)).await.unwrap();
        store.store().await.unwrap();

        let reloaded = CheckpointStore::load(snapshots).await;
        assert_eq!(reloaded.all(), store.all());
        assert_eq!(reloaded.latest().unwrap().height, 4);
    }
}
