//! Incremental block-range scanner.
//!
//! Walks `[start, end]` in ascending order, reusing the locator cache so a
//! repeated query only fetches the unscanned tail: heights already cached
//! for the requested addresses are fetched individually, and the block walk
//! begins past the commonly-checked boundary.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::chain::ChainReader;
use crate::error::ScanError;
use crate::extract::{extract, TxStructure};
use crate::locator::LocatorStore;
use crate::types::{BlockSummary, RawTransaction};

/// Shape of the transaction records a scan returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
    /// Normalized sender/receiver/value structures.
    #[default]
    Structured,
    /// The daemon's verbose decoded transactions, untouched.
    Raw,
}

/// A matched transaction in the caller's chosen shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum TxRecord {
    Raw { tx: RawTransaction },
    Structured { tx: TxStructure },
}

impl TxRecord {
    pub fn txid(&self) -> &str {
        match self {
            Self::Raw { tx } => &tx.txid,
            Self::Structured { tx } => &tx.txid,
        }
    }
}

/// Options controlling a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Trust and reuse cached heights; walk only past the checked boundary.
    pub use_locator: bool,
    /// Include coinbase transactions in the results.
    pub include_coinbase: bool,
    /// Match every transaction instead of filtering by address.
    pub unfiltered: bool,
    /// Shape of the returned records.
    pub format: RecordFormat,
}

/// Cooperative cancellation signal, sampled once per block.
///
/// Cheap to clone; callers typically trip it from a Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a scan produced.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Matching transactions, deduplicated by txid, in discovery order.
    pub matched: Vec<TxRecord>,
    /// Heights newly discovered per requested address (absent from that
    /// address's cached set at scan start).
    pub new_heights: BTreeMap<String, Vec<u64>>,
    /// Last height the walk fully processed; `None` if the walk never ran,
    /// in which case there is no new progress to persist.
    pub last_scanned_height: Option<u64>,
    /// Hash of that block.
    pub last_scanned_hash: Option<String>,
    /// The chain ran out of blocks before `end` was reached.
    pub tip_reached: bool,
    /// The cancellation flag was tripped; results cover processed blocks only.
    pub cancelled: bool,
    /// Total blocks fetched and processed (cached heights plus the walk).
    pub blocks_scanned: u64,
}

/// Walks block ranges against a [`ChainReader`].
pub struct Scanner<'c, C: ChainReader + ?Sized> {
    chain: &'c C,
}

impl<'c, C: ChainReader + ?Sized> Scanner<'c, C> {
    pub fn new(chain: &'c C) -> Self {
        Self { chain }
    }

    /// Scan `[start, end]` for transactions involving `addresses`.
    ///
    /// A single undecodable or missing transaction is skipped with a
    /// warning; transport errors abort. Running past the tip is a normal
    /// partial termination unless zero blocks were processed, which means
    /// `start` lies beyond the tip.
    pub async fn scan_range(
        &self,
        addresses: &[String],
        start: u64,
        end: u64,
        locator: &LocatorStore,
        options: &ScanOptions,
        cancel: &CancelFlag,
    ) -> Result<ScanOutcome, ScanError> {
        if start > end {
            return Err(ScanError::InvalidInput(format!(
                "scan range reversed: {start} > {end}"
            )));
        }
        if addresses.is_empty() && !options.unfiltered {
            return Err(ScanError::InvalidInput(
                "no addresses given and unfiltered mode not requested".into(),
            ));
        }

        // Heights each address already has, so rediscoveries are not re-recorded.
        let mut known: HashMap<&str, BTreeSet<u64>> = addresses
            .iter()
            .map(|a| {
                (
                    a.as_str(),
                    locator.get(a).heights.iter().copied().collect::<BTreeSet<u64>>(),
                )
            })
            .collect();

        let walk_start = if options.use_locator && !addresses.is_empty() {
            let boundary = addresses
                .iter()
                .map(|a| locator.get(a).last_block_height)
                .min()
                .flatten();
            match boundary {
                Some(checked) => start.max(checked + 1),
                // Some address was never checked; walk the full range.
                None => start,
            }
        } else {
            start
        };

        let mut out = ScanOutcome::default();
        let mut seen_txids: HashSet<String> = HashSet::new();

        // Phase 1: cached heights below the walk boundary, those blocks only.
        if walk_start > start {
            let cached: BTreeSet<u64> = known
                .values()
                .flatten()
                .copied()
                .filter(|h| *h >= start && *h <= end && *h < walk_start)
                .collect();
            tracing::debug!(
                from = start,
                walk_start,
                cached = cached.len(),
                "reusing cached heights below the checked boundary"
            );
            for height in cached {
                if cancel.is_cancelled() {
                    out.cancelled = true;
                    return Ok(out);
                }
                let hash = self.chain.block_hash(height).await?;
                let block = self.chain.block(&hash).await?;
                self.scan_block(&block, addresses, &mut known, options, &mut seen_txids, &mut out)
                    .await?;
                out.blocks_scanned += 1;
            }
        }

        // Phase 2: walk the unscanned tail in ascending order.
        let mut height = walk_start;
        while height <= end {
            if cancel.is_cancelled() {
                tracing::info!(height, "scan cancelled — returning partial progress");
                out.cancelled = true;
                break;
            }
            let hash = match self.chain.block_hash(height).await {
                Ok(hash) => hash,
                Err(e) if e.is_not_found() => {
                    if out.blocks_scanned == 0 {
                        let tip = self.chain.height().await?;
                        return Err(ScanError::StartBeyondTip { start, tip });
                    }
                    out.tip_reached = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            let block = self.chain.block(&hash).await?;
            self.scan_block(&block, addresses, &mut known, options, &mut seen_txids, &mut out)
                .await?;
            out.last_scanned_height = Some(height);
            out.last_scanned_hash = Some(hash);
            out.blocks_scanned += 1;
            height += 1;
        }

        Ok(out)
    }

    async fn scan_block(
        &self,
        block: &BlockSummary,
        addresses: &[String],
        known: &mut HashMap<&str, BTreeSet<u64>>,
        options: &ScanOptions,
        seen_txids: &mut HashSet<String>,
        out: &mut ScanOutcome,
    ) -> Result<(), ScanError> {
        for txid in &block.txids {
            let raw = match self.chain.raw_transaction(txid).await {
                Ok(raw) => raw,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(txid = %txid, height = block.height, "transaction listed but not retrievable — skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let tx = match extract(self.chain, &raw, Some(block.height)).await {
                Ok(tx) => tx,
                Err(ScanError::Corrupted(reason)) => {
                    tracing::warn!(txid = %txid, height = block.height, %reason, "skipping corrupted transaction");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if tx.coinbase && !options.include_coinbase {
                continue;
            }
            if !options.unfiltered && !tx.involves_any(addresses) {
                continue;
            }

            for address in addresses {
                if tx.involves_address(address) {
                    let cached = known
                        .get_mut(address.as_str())
                        .map(|set| !set.insert(block.height))
                        .unwrap_or(false);
                    if !cached {
                        out.new_heights
                            .entry(address.clone())
                            .or_default()
                            .push(block.height);
                    }
                }
            }

            if seen_txids.insert(tx.txid.clone()) {
                out.matched.push(match options.format {
                    RecordFormat::Raw => TxRecord::Raw { tx: raw },
                    RecordFormat::Structured => TxRecord::Structured { tx },
                });
            }
        }
        Ok(())
    }
}
