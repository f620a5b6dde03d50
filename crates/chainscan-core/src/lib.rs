//! chainscan-core — reorg-safe address scanning and caching engine.
//!
//! # Architecture
//!
//! ```text
//! ScanEngine (operations facade)
//!     ├── Scanner          (incremental block-range walk, cancellation)
//!     │      └── extract   (tx → sender/receiver/value structure)
//!     ├── LocatorStore     (per-address cached heights + scan boundary)
//!     ├── CheckpointStore  (height→hash safety net, reorg guard, pruning)
//!     ├── ChainReader      (daemon access: chainscan-rpc / MemoryChain)
//!     └── KeyedSnapshotStore (persistence: chainscan-storage / memory)
//! ```

pub mod bounds;
pub mod chain;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod extract;
pub mod locator;
pub mod scanner;
pub mod snapshot;
pub mod types;

pub use bounds::RangeBound;
pub use chain::{ChainReader, MemoryChain};
pub use checkpoint::{
    Checkpoint, CheckpointState, CheckpointStore, PruneThreshold, ReorgStatus,
};
pub use engine::{CacheReport, CacheSpan, ListOutcome, OrphanPruneReport, ScanEngine};
pub use error::ScanError;
pub use extract::{TxSlot, TxStructure};
pub use locator::{Locator, LocatorStore};
pub use scanner::{CancelFlag, RecordFormat, ScanOptions, ScanOutcome, Scanner, TxRecord};
pub use snapshot::{KeyedSnapshotStore, MemorySnapshots, Snapshot};
pub use types::{BlockSummary, RawTransaction, ScriptPubKey, TxIn, TxOut};
