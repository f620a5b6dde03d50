//! The operations facade — what the CLI (or any business layer) consumes.
//!
//! `ScanEngine` owns the chain reader and both typed stores and wires them
//! together: queries run a reorg check before trusting cached data, caching
//! persists locator progress and pins a checkpoint, and orphan pruning
//! drops invalidated cached heights in the same operation. Destructive
//! operations default to a dry run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::bounds::{resolve_range, RangeBound};
use crate::chain::ChainReader;
use crate::checkpoint::{
    Checkpoint, CheckpointState, CheckpointStore, PruneThreshold, ReorgStatus,
};
use crate::error::ScanError;
use crate::locator::{Locator, LocatorStore};
use crate::scanner::{CancelFlag, ScanOptions, ScanOutcome, Scanner, TxRecord};
use crate::snapshot::KeyedSnapshotStore;

/// How far past the start a cache run extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSpan {
    /// Scan exactly this many blocks.
    Blocks(u64),
    /// Scan through the current tip.
    ToTip,
}

/// Result of `list_transactions`.
#[derive(Debug, Serialize)]
pub struct ListOutcome {
    pub transactions: Vec<TxRecord>,
    pub blocks_scanned: u64,
    pub tip_reached: bool,
    pub cancelled: bool,
}

/// Result of `cache_addresses`.
#[derive(Debug, Serialize)]
pub struct CacheReport {
    pub addresses: Vec<String>,
    pub start: u64,
    pub end: u64,
    pub blocks_scanned: u64,
    pub new_heights: BTreeMap<String, Vec<u64>>,
    pub last_scanned_height: Option<u64>,
    pub tip_reached: bool,
    pub cancelled: bool,
    /// Pinned at the last scanned block, unless the run was cancelled.
    pub checkpoint: Option<Checkpoint>,
}

/// Result of `erase_locators`.
#[derive(Debug, Serialize)]
pub struct EraseReport {
    pub erased: Vec<String>,
    pub missing: Vec<String>,
    pub dry_run: bool,
}

/// Result of `prune_checkpoints`.
#[derive(Debug, Serialize)]
pub struct CheckpointPruneReport {
    pub removed: Vec<Checkpoint>,
    pub retained: usize,
    pub dry_run: bool,
}

/// One checkpoint with its verdict against the live chain.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointView {
    pub height: u64,
    pub hash: String,
    pub state: CheckpointState,
}

/// Result of `prune_orphan_checkpoints`.
#[derive(Debug, Serialize)]
pub struct OrphanPruneReport {
    /// Every stored checkpoint with its verdict, ascending by height.
    pub checkpoints: Vec<CheckpointView>,
    /// Fresh checkpoints seeded after deletion (confirmed runs only).
    pub reseeded: Vec<Checkpoint>,
    /// Highest surviving checkpoint height; cached locator heights above it
    /// are dropped in the same operation.
    pub locator_cutoff: Option<u64>,
    pub heights_dropped: usize,
    pub dry_run: bool,
}

/// The scanning and caching engine behind the CLI operations.
pub struct ScanEngine<C: ChainReader> {
    chain: C,
    locators: LocatorStore,
    checkpoints: CheckpointStore,
    cancel: CancelFlag,
}

impl<C: ChainReader> ScanEngine<C> {
    /// Load both stores from `snapshots` and wrap them with `chain`.
    pub async fn open(chain: C, snapshots: Arc<dyn KeyedSnapshotStore>) -> Self {
        let locators = LocatorStore::load(snapshots.clone()).await;
        let checkpoints = CheckpointStore::load(snapshots).await;
        Self {
            chain,
            locators,
            checkpoints,
            cancel: CancelFlag::new(),
        }
    }

    /// The cancellation flag the scan loop samples; wire it to Ctrl-C.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn set_min_retained_checkpoints(&mut self, min_retained: usize) {
        self.checkpoints.set_min_retained(min_retained);
    }

    /// Transactions involving `addresses` within the resolved range.
    ///
    /// With `use_locator`, a reorg check runs first — cached data is not
    /// trusted across an unacknowledged reorg — and discovered heights plus
    /// the advanced boundary are written back afterwards.
    pub async fn list_transactions(
        &mut self,
        addresses: &[String],
        start: RangeBound,
        end: RangeBound,
        options: ScanOptions,
    ) -> Result<ListOutcome, ScanError> {
        let (start_height, end_height) = resolve_range(&self.chain, &start, &end).await?;
        if options.use_locator {
            self.checkpoints.reorg_check(&self.chain).await?;
        }
        let outcome = Scanner::new(&self.chain)
            .scan_range(
                addresses,
                start_height,
                end_height,
                &self.locators,
                &options,
                &self.cancel,
            )
            .await?;
        if options.use_locator {
            self.persist_progress(addresses, &outcome, start_height)
                .await?;
        }
        Ok(ListOutcome {
            transactions: outcome.matched,
            blocks_scanned: outcome.blocks_scanned,
            tip_reached: outcome.tip_reached,
            cancelled: outcome.cancelled,
        })
    }

    /// Scan forward from `start` and persist locator progress for
    /// `addresses`. `force` realigns each record to `start` first,
    /// discarding stale data. On an uncancelled run a checkpoint is pinned
    /// at the last scanned block.
    pub async fn cache_addresses(
        &mut self,
        addresses: &[String],
        start: RangeBound,
        span: CacheSpan,
        force: bool,
    ) -> Result<CacheReport, ScanError> {
        if addresses.is_empty() {
            return Err(ScanError::InvalidInput("no addresses to cache".into()));
        }
        self.checkpoints.reorg_check(&self.chain).await?;

        let tip = self.chain.height().await?;
        let start_height = match start {
            RangeBound::Height(h) => h,
            // An open upper bound sidesteps spurious reversed-range errors.
            date => resolve_range(&self.chain, &date, &RangeBound::Height(u64::MAX))
                .await?
                .0,
        };
        if start_height > tip {
            return Err(ScanError::StartBeyondTip {
                start: start_height,
                tip,
            });
        }
        let end_height = match span {
            CacheSpan::Blocks(0) => {
                return Err(ScanError::InvalidInput("cannot cache zero blocks".into()))
            }
            CacheSpan::Blocks(n) => start_height.saturating_add(n - 1),
            CacheSpan::ToTip => tip,
        };

        if force {
            for address in addresses {
                self.locators.force_start(address, start_height);
            }
        }

        // Coinbase payouts to a tracked address are cacheable history too.
        let options = ScanOptions {
            use_locator: true,
            include_coinbase: true,
            ..Default::default()
        };
        let outcome = Scanner::new(&self.chain)
            .scan_range(
                addresses,
                start_height,
                end_height,
                &self.locators,
                &options,
                &self.cancel,
            )
            .await?;

        let persisted = self
            .persist_progress(addresses, &outcome, start_height)
            .await?;
        let checkpoint = match (&outcome.last_scanned_height, &outcome.last_scanned_hash) {
            (Some(height), Some(hash)) if persisted && !outcome.cancelled => {
                let cp = self.checkpoints.insert(*height, hash);
                self.checkpoints.store().await?;
                Some(cp)
            }
            _ => None,
        };

        Ok(CacheReport {
            addresses: addresses.to_vec(),
            start: start_height,
            end: end_height,
            blocks_scanned: outcome.blocks_scanned,
            new_heights: outcome.new_heights,
            last_scanned_height: outcome.last_scanned_height,
            tip_reached: outcome.tip_reached,
            cancelled: outcome.cancelled,
            checkpoint,
        })
    }

    /// Locator records for `addresses`, or all tracked records when `None`.
    /// Unseen addresses show as empty defaults.
    pub fn show_locators(&self, addresses: Option<&[String]>) -> BTreeMap<String, Locator> {
        match addresses {
            None => self.locators.all().clone(),
            Some(list) => list
                .iter()
                .map(|a| (a.clone(), self.locators.get(a)))
                .collect(),
        }
    }

    /// Remove locator records. Dry run unless `confirm`.
    pub async fn erase_locators(
        &mut self,
        addresses: &[String],
        confirm: bool,
    ) -> Result<EraseReport, ScanError> {
        let mut erased = Vec::new();
        let mut missing = Vec::new();
        for address in addresses {
            if self.locators.contains(address) {
                erased.push(address.clone());
            } else {
                missing.push(address.clone());
            }
        }
        if confirm {
            for address in &erased {
                self.locators.erase(address);
            }
            self.locators.store().await?;
        }
        Ok(EraseReport {
            erased,
            missing,
            dry_run: !confirm,
        })
    }

    /// Store a checkpoint at `height`, or the current tip.
    pub async fn set_checkpoint(&mut self, height: Option<u64>) -> Result<Checkpoint, ScanError> {
        let cp = self.checkpoints.record(&self.chain, height).await?;
        self.checkpoints.store().await?;
        Ok(cp)
    }

    /// The checkpoint at `height`, or the newest one.
    pub fn show_checkpoint(&self, height: Option<u64>) -> Option<Checkpoint> {
        match height {
            Some(h) => self.checkpoints.get(h),
            None => self.checkpoints.latest(),
        }
    }

    pub fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.all()
    }

    /// Compare the newest checkpoint against the live chain. Initializes on
    /// first call; a mismatch surfaces as `ReorgDetected`.
    pub async fn reorg_check(&mut self) -> Result<ReorgStatus, ScanError> {
        self.checkpoints.reorg_check(&self.chain).await
    }

    /// Delete checkpoints past `threshold`, preserving the minimum retained
    /// count. Dry run unless `confirm`.
    pub async fn prune_checkpoints(
        &mut self,
        threshold: PruneThreshold,
        confirm: bool,
    ) -> Result<CheckpointPruneReport, ScanError> {
        let removed = self.checkpoints.plan_prune_old(threshold);
        if confirm {
            self.checkpoints.remove(&removed);
            self.checkpoints.store().await?;
        }
        Ok(CheckpointPruneReport {
            retained: self.checkpoints.len() - if confirm { 0 } else { removed.len() },
            removed,
            dry_run: !confirm,
        })
    }

    /// Compare every checkpoint against the live chain, delete the
    /// mismatches, reseed to the minimum, and drop cached locator heights
    /// above the highest surviving checkpoint. Dry run unless `confirm`.
    pub async fn prune_orphan_checkpoints(
        &mut self,
        confirm: bool,
    ) -> Result<OrphanPruneReport, ScanError> {
        let scan = self.checkpoints.scan_orphans(&self.chain).await?;
        let mut checkpoints: Vec<CheckpointView> = scan
            .valid
            .iter()
            .map(|cp| CheckpointView {
                height: cp.height,
                hash: cp.hash.clone(),
                state: CheckpointState::Valid,
            })
            .chain(scan.orphaned.iter().map(|cp| CheckpointView {
                height: cp.height,
                hash: cp.hash.clone(),
                state: CheckpointState::Orphaned,
            }))
            .collect();
        checkpoints.sort_by_key(|view| view.height);

        let locator_cutoff = if scan.orphaned.is_empty() {
            None
        } else {
            scan.valid.last().map(|cp| cp.height)
        };

        let (reseeded, heights_dropped) = if confirm {
            let reseeded = self.checkpoints.apply_orphan_prune(&self.chain, &scan).await?;
            let dropped = match locator_cutoff {
                Some(cutoff) => self.locators.prune_orphans(cutoff),
                None => 0,
            };
            self.checkpoints.store().await?;
            self.locators.store().await?;
            (reseeded, dropped)
        } else {
            let planned = match locator_cutoff {
                Some(cutoff) => self
                    .locators
                    .all()
                    .values()
                    .flat_map(|rec| rec.heights.iter())
                    .filter(|h| **h > cutoff)
                    .count(),
                None => 0,
            };
            (Vec::new(), planned)
        };

        Ok(OrphanPruneReport {
            checkpoints,
            reseeded,
            locator_cutoff,
            heights_dropped,
            dry_run: !confirm,
        })
    }

    /// Write back scan progress: merge each address's new heights and
    /// advance its boundary to the last fully scanned block. A scan whose
    /// walk never ran has nothing to persist.
    async fn persist_progress(
        &mut self,
        addresses: &[String],
        outcome: &ScanOutcome,
        scan_start: u64,
    ) -> Result<bool, ScanError> {
        let (Some(last_height), Some(last_hash)) =
            (outcome.last_scanned_height, outcome.last_scanned_hash.as_deref())
        else {
            return Ok(false);
        };
        let empty = Vec::new();
        for address in addresses {
            let new_heights = outcome.new_heights.get(address).unwrap_or(&empty);
            self.locators
                .update_heights(address, new_heights, last_height, last_hash, scan_start);
        }
        self.locators.store().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{coinbase_tx, MemoryChain};
    use crate::snapshot::MemorySnapshots;

    async fn engine_with_blocks(blocks: u64) -> ScanEngine<MemoryChain> {
        let chain = MemoryChain::new();
        for i in 0..blocks {
            chain.add_block(vec![coinbase_tx(&format!("cb{i}"), "miner", 50.0)]);
        }
        ScanEngine::open(chain, Arc::new(MemorySnapshots::new())).await
    }

    #[tokio::test]
    async fn checkpoint_set_show_list() {
        let mut engine = engine_with_blocks(10).await;
        let cp = engine.set_checkpoint(Some(4)).await.unwrap();
        assert_eq!(cp.height, 4);
        engine.set_checkpoint(None).await.unwrap();

        assert_eq!(engine.show_checkpoint(None).unwrap().height, 9);
        assert_eq!(engine.show_checkpoint(Some(4)).unwrap().height, 4);
        assert!(engine.show_checkpoint(Some(7)).is_none());
        assert_eq!(engine.list_checkpoints().len(), 2);
    }

    #[tokio::test]
    async fn set_checkpoint_past_tip_fails() {
        let mut engine = engine_with_blocks(3).await;
        let err = engine.set_checkpoint(Some(50)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn erase_defaults_to_dry_run() {
        let mut engine = engine_with_blocks(3).await;
        engine.locators.update_heights("a", &[1], 2, "h2", 0);

        let report = engine
            .erase_locators(&["a".into(), "ghost".into()], false)
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.erased, vec!["a"]);
        assert_eq!(report.missing, vec!["ghost"]);
        assert!(engine.locators.contains("a"));

        let report = engine.erase_locators(&["a".into()], true).await.unwrap();
        assert!(!report.dry_run);
        assert!(!engine.locators.contains("a"));
    }

    #[tokio::test]
    async fn show_locators_reports_unseen_as_default() {
        let mut engine = engine_with_blocks(3).await;
        engine.locators.update_heights("a", &[1], 2, "h2", 0);

        let all = engine.show_locators(None);
        assert_eq!(all.len(), 1);

        let some = engine.show_locators(Some(&["a".into(), "ghost".into()]));
        assert_eq!(some.len(), 2);
        assert_eq!(some.get("ghost").unwrap(), &Locator::default());
    }

    #[tokio::test]
    async fn cache_zero_blocks_is_invalid() {
        let mut engine = engine_with_blocks(3).await;
        let err = engine
            .cache_addresses(&["a".into()], RangeBound::Height(0), CacheSpan::Blocks(0), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn cache_start_beyond_tip_fails() {
        let mut engine = engine_with_blocks(3).await;
        let err = engine
            .cache_addresses(&["a".into()], RangeBound::Height(99), CacheSpan::ToTip, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::StartBeyondTip { start: 99, tip: 2 }));
    }
}
