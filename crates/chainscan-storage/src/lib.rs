//! Snapshot persistence backends for ChainScan.
//!
//! Backends implement `chainscan-core`'s [`KeyedSnapshotStore`]:
//! - [`JsonFileSnapshots`] — one JSON file holding all categories
//! - [`MemorySnapshots`] (re-exported from core) — tests and ephemeral runs

pub mod json_file;

pub use chainscan_core::snapshot::{KeyedSnapshotStore, MemorySnapshots, Snapshot};
pub use json_file::JsonFileSnapshots;
