//! chainscan-rpc — JSON-RPC `ChainReader` for bitcoin-family daemons.

pub mod client;
pub mod jsonrpc;

pub use client::{DaemonClient, DaemonConfig};
pub use jsonrpc::{RpcError, RpcRequest, RpcResponse};
