//! Shared types: block summaries and the daemon's verbose transaction shape.

use serde::{Deserialize, Serialize};

/// Base units (satoshis) per whole coin on the wire.
pub const COIN: f64 = 100_000_000.0;

/// Convert a decimal coin amount from the wire into integer base units.
///
/// The conversion happens once, at the extraction boundary; everything
/// downstream carries `u64` satoshis.
pub fn to_base_units(coins: f64) -> u64 {
    (coins * COIN).round() as u64
}

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A minimal summary of a block — enough for the scanner to walk a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block height.
    pub height: u64,
    /// Block hash.
    pub hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub time: i64,
    /// Transaction ids contained in the block, in block order.
    pub txids: Vec<String>,
}

// ─── RawTransaction ───────────────────────────────────────────────────────────

/// A verbose decoded transaction as returned by `getrawtransaction`.
///
/// `vin`/`vout` are `Option` so that their *absence* on the wire is visible:
/// the extractor reports a transaction without them as corrupted rather than
/// silently treating it as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<Vec<TxIn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<Vec<TxOut>>,
    /// Hash of the containing block; `None` for unconfirmed transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockhash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,
}

/// A transaction input: either a previous-output reference or a coinbase marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TxIn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
    /// Present (with the raw scriptSig hex) only on coinbase inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOut {
    pub n: u32,
    /// Decimal coin amount, as the daemon reports it.
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

/// The script half of an output — addresses are empty for non-standard scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub script_type: Option<String>,
}

impl RawTransaction {
    /// Returns `true` if any input carries a coinbase marker.
    pub fn has_coinbase_input(&self) -> bool {
        self.vin
            .as_deref()
            .is_some_and(|vin| vin.iter().any(|i| i.coinbase.is_some()))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
