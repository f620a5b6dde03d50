//! Read-only blockchain access — the trait the engine consumes, plus an
//! in-memory chain for tests and simulations.

use async_trait::async_trait;

use crate::error::ScanError;
use crate::types::{BlockSummary, RawTransaction, ScriptPubKey, TxIn, TxOut};

/// Trait for read-only access to a chain daemon.
///
/// Implementations include `chainscan-rpc`'s `DaemonClient` and the
/// `MemoryChain` below. All calls are blocking round-trips for the calling
/// task; retry and timeout policy belongs to the implementation.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current tip height.
    async fn height(&self) -> Result<u64, ScanError>;

    /// Hash of the block at `height`. `NotFound` past the tip.
    async fn block_hash(&self, height: u64) -> Result<String, ScanError>;

    /// Block summary by hash. `NotFound` for unknown or replaced blocks.
    async fn block(&self, hash: &str) -> Result<BlockSummary, ScanError>;

    /// Verbose decoded transaction by id. `NotFound` if absent.
    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, ScanError>;
}

// ─── MemoryChain ──────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// Unix timestamp of the first in-memory block; successors are 10 minutes apart.
pub const GENESIS_TIME: i64 = 1_700_000_000;

struct StoredBlock {
    hash: String,
    time: i64,
    txids: Vec<String>,
}

#[derive(Default)]
struct ChainInner {
    blocks: Vec<StoredBlock>,
    txs: HashMap<String, RawTransaction>,
    /// Bumped on every `invalidate` so replacement blocks get fresh hashes.
    fork: u32,
}

/// In-memory chain for tests and simulations.
///
/// Blocks are appended with deterministic hashes and evenly spaced
/// timestamps; `invalidate` truncates the chain so a replacement block with
/// a different hash can be appended, faking a reorg.
#[derive(Default)]
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block containing `txs`, returning its height.
    pub fn add_block(&self, txs: Vec<RawTransaction>) -> u64 {
        let time = {
            let inner = self.inner.lock().unwrap();
            GENESIS_TIME + inner.blocks.len() as i64 * 600
        };
        self.add_block_at(time, txs)
    }

    /// Append a block with an explicit timestamp, returning its height.
    pub fn add_block_at(&self, time: i64, mut txs: Vec<RawTransaction>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let height = inner.blocks.len() as u64;
        let hash = if inner.fork == 0 {
            format!("blk{height:06}")
        } else {
            format!("blk{height:06}-{}", inner.fork)
        };
        let mut txids = Vec::with_capacity(txs.len());
        for tx in &mut txs {
            tx.blockhash = Some(hash.clone());
            txids.push(tx.txid.clone());
        }
        for tx in txs {
            inner.txs.insert(tx.txid.clone(), tx);
        }
        inner.blocks.push(StoredBlock { hash, time, txids });
        height
    }

    /// Drop the block at `height` and everything above it. Blocks appended
    /// afterwards carry different hashes, so a re-added height looks like a
    /// replacement block from a competing chain.
    pub fn invalidate(&self, height: u64) {
        let mut inner = self.inner.lock().unwrap();
        let keep = height as usize;
        for removed in inner.blocks.split_off(keep) {
            for txid in &removed.txids {
                inner.txs.remove(txid);
            }
        }
        inner.fork += 1;
    }

    /// Number of blocks currently on the chain.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChainReader for MemoryChain {
    async fn height(&self) -> Result<u64, ScanError> {
        let inner = self.inner.lock().unwrap();
        if inner.blocks.is_empty() {
            return Err(ScanError::NotFound("chain has no blocks".into()));
        }
        Ok(inner.blocks.len() as u64 - 1)
    }

    async fn block_hash(&self, height: u64) -> Result<String, ScanError> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .get(height as usize)
            .map(|b| b.hash.clone())
            .ok_or_else(|| ScanError::NotFound(format!("no block at height {height}")))
    }

    async fn block(&self, hash: &str) -> Result<BlockSummary, ScanError> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .iter()
            .position(|b| b.hash == hash)
            .map(|idx| {
                let b = &inner.blocks[idx];
                BlockSummary {
                    height: idx as u64,
                    hash: b.hash.clone(),
                    time: b.time,
                    txids: b.txids.clone(),
                }
            })
            .ok_or_else(|| ScanError::NotFound(format!("no block with hash {hash}")))
    }

    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, ScanError> {
        let inner = self.inner.lock().unwrap();
        inner
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| ScanError::NotFound(format!("no transaction {txid}")))
    }
}

// ─── Test transaction builders ────────────────────────────────────────────────

/// Build a coinbase transaction paying `value` coins to `to`.
pub fn coinbase_tx(txid: &str, to: &str, value: f64) -> RawTransaction {
    RawTransaction {
        txid: txid.to_string(),
        vin: Some(vec![TxIn {
            coinbase: Some("04ffff001d".into()),
            ..Default::default()
        }]),
        vout: Some(vec![pay_out(0, to, value)]),
        blockhash: None,
        confirmations: None,
    }
}

/// Build a transaction spending `prev` output `prev_n`, paying `value` coins to `to`.
pub fn payment_tx(txid: &str, prev: &str, prev_n: u32, to: &str, value: f64) -> RawTransaction {
    RawTransaction {
        txid: txid.to_string(),
        vin: Some(vec![TxIn {
            txid: Some(prev.to_string()),
            vout: Some(prev_n),
            coinbase: None,
        }]),
        vout: Some(vec![pay_out(0, to, value)]),
        blockhash: None,
        confirmations: None,
    }
}

fn pay_out(n: u32, to: &str, value: f64) -> TxOut {
    TxOut {
        n,
        value,
        script_pub_key: ScriptPubKey {
            addresses: vec![to.to_string()],
            script_type: Some("pubkeyhash".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_chain_has_no_height() {
        let chain = MemoryChain::new();
        assert!(chain.height().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn blocks_roundtrip() {
        let chain = MemoryChain::new();
        chain.add_block(vec![coinbase_tx("cb0", "miner", 50.0)]);
        chain.add_block(vec![coinbase_tx("cb1", "miner", 50.0)]);

        assert_eq!(chain.height().await.unwrap(), 1);
        let hash = chain.block_hash(1).await.unwrap();
        let block = chain.block(&hash).await.unwrap();
        assert_eq!(block.height, 1);
        assert_eq!(block.txids, vec!["cb1"]);
        assert_eq!(block.time, GENESIS_TIME + 600);

        let tx = chain.raw_transaction("cb1").await.unwrap();
        assert_eq!(tx.blockhash, Some(hash));
    }

    #[tokio::test]
    async fn past_tip_is_not_found() {
        let chain = MemoryChain::new();
        chain.add_block(vec![]);
        assert!(chain.block_hash(1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn invalidate_fakes_a_reorg() {
        let chain = MemoryChain::new();
        for i in 0..5 {
            chain.add_block(vec![coinbase_tx(&format!("cb{i}"), "miner", 50.0)]);
        }
        let old_hash = chain.block_hash(4).await.unwrap();

        chain.invalidate(4);
        chain.add_block(vec![coinbase_tx("cb4b", "rival", 50.0)]);

        let new_hash = chain.block_hash(4).await.unwrap();
        assert_ne!(old_hash, new_hash);
        // The replaced block and its transactions are gone
        assert!(chain.block(&old_hash).await.unwrap_err().is_not_found());
        assert!(chain.raw_transaction("cb4").await.unwrap_err().is_not_found());
    }
}
