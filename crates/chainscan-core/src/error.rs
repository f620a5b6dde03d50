//! Error types for the scanning engine.

use thiserror::Error;

/// Errors that can occur while scanning, caching, or guarding chain state.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Bad caller-supplied height, date, or address.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Malformed block or transaction data from the chain.
    #[error("corrupted chain data: {0}")]
    Corrupted(String),

    /// The chain diverged from a stored checkpoint.
    #[error("reorg detected at height {height}: expected hash {expected}, got {actual}")]
    ReorgDetected {
        height: u64,
        expected: String,
        actual: String,
    },

    /// Persisted snapshot data could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport or daemon failure from the chain reader.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// A block or transaction that should exist is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested scan start lies beyond the current chain tip.
    #[error("scan start {start} is beyond the current tip {tip}")]
    StartBeyondTip { start: u64, tip: u64 },
}

impl ScanError {
    /// Returns `true` if the error is a reorg — callers about to mutate
    /// chain state must treat this as a hard stop.
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ReorgDetected { .. })
    }

    /// Returns `true` if the error is a plain "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
