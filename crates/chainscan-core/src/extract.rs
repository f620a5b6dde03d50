//! Transaction structure extraction — normalizes a verbose transaction into
//! sender/receiver/value data.
//!
//! Each input's senders come from the previous output it spends, which costs
//! one extra `raw_transaction` lookup per input. An unresolvable input
//! (coinbase, pruned data) contributes no sender; that is a signal, not an
//! error.

use serde::{Deserialize, Serialize};

use crate::chain::ChainReader;
use crate::error::ScanError;
use crate::types::{to_base_units, RawTransaction};

/// One side of a transaction: the addresses involved and the value moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TxSlot {
    /// Sender addresses (inputs) or receiver addresses (outputs).
    /// Empty for coinbase inputs, unresolvable inputs, and non-standard scripts.
    pub addresses: Vec<String>,
    /// Value in base units (satoshis).
    pub value: u64,
}

/// The normalized structure of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStructure {
    pub txid: String,
    pub inputs: Vec<TxSlot>,
    pub outputs: Vec<TxSlot>,
    /// Height of the containing block; `None` for unconfirmed transactions.
    pub block_height: Option<u64>,
    /// `true` if any input carried a coinbase marker.
    pub coinbase: bool,
}

impl TxStructure {
    /// Returns `true` if `address` appears among senders or receivers.
    pub fn involves_address(&self, address: &str) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .any(|slot| slot.addresses.iter().any(|a| a == address))
    }

    /// Returns `true` if any sender or receiver intersects `addresses`.
    pub fn involves_any(&self, addresses: &[String]) -> bool {
        addresses.iter().any(|a| self.involves_address(a))
    }
}

/// Extract a [`TxStructure`] from a verbose transaction.
///
/// `known_height` skips the block lookup when the caller already walked the
/// containing block. Fails with `Corrupted` when `vin`/`vout` are absent;
/// callers must treat that as skippable, not fatal.
pub async fn extract<C: ChainReader + ?Sized>(
    chain: &C,
    tx: &RawTransaction,
    known_height: Option<u64>,
) -> Result<TxStructure, ScanError> {
    let vin = tx
        .vin
        .as_deref()
        .ok_or_else(|| ScanError::Corrupted(format!("transaction {} has no vin", tx.txid)))?;
    let vout = tx
        .vout
        .as_deref()
        .ok_or_else(|| ScanError::Corrupted(format!("transaction {} has no vout", tx.txid)))?;

    let mut coinbase = false;
    let mut inputs = Vec::with_capacity(vin.len());
    for input in vin {
        if input.coinbase.is_some() {
            coinbase = true;
            inputs.push(TxSlot::default());
            continue;
        }
        let (Some(prev_txid), Some(prev_n)) = (input.txid.as_deref(), input.vout) else {
            inputs.push(TxSlot::default());
            continue;
        };
        match chain.raw_transaction(prev_txid).await {
            Ok(prev) => inputs.push(resolve_prev_output(&prev, prev_n)),
            // Pruned or otherwise missing previous transaction: no sender.
            Err(e) if e.is_not_found() => inputs.push(TxSlot::default()),
            Err(e) => return Err(e),
        }
    }

    let outputs = vout
        .iter()
        .map(|out| TxSlot {
            addresses: out.script_pub_key.addresses.clone(),
            value: to_base_units(out.value),
        })
        .collect();

    let block_height = match known_height {
        Some(h) => Some(h),
        None => match tx.blockhash.as_deref() {
            Some(hash) => Some(chain.block(hash).await?.height),
            None => None,
        },
    };

    Ok(TxStructure {
        txid: tx.txid.clone(),
        inputs,
        outputs,
        block_height,
        coinbase,
    })
}

fn resolve_prev_output(prev: &RawTransaction, n: u32) -> TxSlot {
    prev.vout
        .as_deref()
        .and_then(|outs| outs.iter().find(|o| o.n == n))
        .map(|out| TxSlot {
            addresses: out.script_pub_key.addresses.clone(),
            value: to_base_units(out.value),
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{coinbase_tx, payment_tx, MemoryChain};

    #[tokio::test]
    async fn resolves_senders_from_previous_outputs() {
        let chain = MemoryChain::new();
        chain.add_block(vec![coinbase_tx("cb0", "alice", 50.0)]);
        chain.add_block(vec![payment_tx("pay1", "cb0", 0, "bob", 12.5)]);

        let raw = chain.raw_transaction("pay1").await.unwrap();
        let tx = extract(&chain, &raw, Some(1)).await.unwrap();

        assert!(!tx.coinbase);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].addresses, vec!["alice"]);
        assert_eq!(tx.inputs[0].value, 5_000_000_000);
        assert_eq!(tx.outputs[0].addresses, vec!["bob"]);
        assert_eq!(tx.outputs[0].value, 1_250_000_000);
        assert_eq!(tx.block_height, Some(1));
        assert!(tx.involves_address("alice"));
        assert!(tx.involves_address("bob"));
        assert!(!tx.involves_address("carol"));
    }

    #[tokio::test]
    async fn coinbase_input_has_no_sender() {
        let chain = MemoryChain::new();
        chain.add_block(vec![coinbase_tx("cb0", "miner", 50.0)]);

        let raw = chain.raw_transaction("cb0").await.unwrap();
        let tx = extract(&chain, &raw, Some(0)).await.unwrap();

        assert!(tx.coinbase);
        assert_eq!(tx.inputs.len(), 1);
        assert!(tx.inputs[0].addresses.is_empty());
        assert_eq!(tx.inputs[0].value, 0);
    }

    #[tokio::test]
    async fn missing_prev_tx_is_not_an_error() {
        let chain = MemoryChain::new();
        chain.add_block(vec![payment_tx("orphan-spend", "gone", 0, "bob", 1.0)]);

        let raw = chain.raw_transaction("orphan-spend").await.unwrap();
        let tx = extract(&chain, &raw, Some(0)).await.unwrap();
        assert!(tx.inputs[0].addresses.is_empty());
        assert!(!tx.coinbase);
    }

    #[tokio::test]
    async fn missing_vin_is_corrupted() {
        let chain = MemoryChain::new();
        let raw = RawTransaction {
            txid: "bad".into(),
            vin: None,
            vout: Some(vec![]),
            blockhash: None,
            confirmations: None,
        };
        let err = extract(&chain, &raw, None).await.unwrap_err();
        assert!(matches!(err, ScanError::Corrupted(_)));
    }

    #[tokio::test]
    async fn height_resolved_via_block_reference() {
        let chain = MemoryChain::new();
        chain.add_block(vec![]);
        chain.add_block(vec![coinbase_tx("cb1", "miner", 50.0)]);

        let raw = chain.raw_transaction("cb1").await.unwrap();
        let tx = extract(&chain, &raw, None).await.unwrap();
        assert_eq!(tx.block_height, Some(1));
    }

    #[tokio::test]
    async fn unconfirmed_tx_has_no_height() {
        let chain = MemoryChain::new();
        let raw = payment_tx("mempool", "gone", 0, "bob", 1.0);
        let tx = extract(&chain, &raw, None).await.unwrap();
        assert_eq!(tx.block_height, None);
    }
}
