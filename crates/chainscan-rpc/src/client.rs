//! HTTP JSON-RPC `ChainReader` backed by `reqwest`.
//!
//! Wraps a bitcoin-family daemon (`getblockcount`, `getblockhash`,
//! `getblock`, `getrawtransaction`) with basic auth, a request timeout, and
//! bounded exponential retry for transport-level failures. Daemon-level
//! errors are never retried; "no such block/transaction" codes map to
//! `ScanError::NotFound` for callers to match on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use chainscan_core::{BlockSummary, ChainReader, RawTransaction, ScanError};

use crate::jsonrpc::{is_not_found_code, RpcRequest, RpcResponse};

/// Configuration for [`DaemonClient`].
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
    /// Retries after the first attempt, transport failures only.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl DaemonConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(250),
        }
    }

    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

/// JSON-RPC client for a bitcoin-family daemon.
pub struct DaemonClient {
    config: DaemonConfig,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl DaemonClient {
    pub fn new(config: DaemonConfig) -> Result<Self, ScanError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ScanError::Rpc(format!("building HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    async fn send_once(&self, req: &RpcRequest) -> Result<RpcResponse, ScanError> {
        let mut builder = self.http.post(&self.config.url).json(req);
        if let Some(user) = &self.config.user {
            builder = builder.basic_auth(user, self.config.password.as_deref());
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ScanError::Rpc(format!("sending {}: {e}", req.method)))?;

        let status = resp.status();
        // Daemons put JSON-RPC errors in non-200 bodies too; try to parse
        // before giving up on the status code.
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ScanError::Rpc(format!("reading {} response: {e}", req.method)))?;
        match serde_json::from_slice::<RpcResponse>(&bytes) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(ScanError::Rpc(format!(
                "HTTP {status} from {}",
                self.config.url
            ))),
            Err(e) => Err(ScanError::Rpc(format!(
                "decoding {} response: {e}",
                req.method
            ))),
        }
    }

    /// One RPC round-trip with bounded retry on transport failures.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ScanError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = RpcRequest::new(id, method, params);

        let mut attempt = 0u32;
        let resp = loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(resp) => break resp,
                Err(e) if attempt <= self.config.max_retries => {
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        method,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "retrying daemon call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(method, attempt, error = %e, "daemon call failed");
                    return Err(e);
                }
            }
        };

        if let Some(err) = resp.error {
            if is_not_found_code(err.code) {
                return Err(ScanError::NotFound(format!("{method}: {}", err.message)));
            }
            return Err(ScanError::Rpc(format!("{method}: {err}")));
        }
        resp.result
            .ok_or_else(|| ScanError::Rpc(format!("{method}: response carried no result")))
    }

    async fn call_as<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, ScanError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| ScanError::Corrupted(format!("{method} result: {e}")))
    }
}

/// `getblock` verbosity-1 shape, narrowed to what the scanner needs.
#[derive(Debug, Deserialize)]
struct GetBlock {
    height: u64,
    hash: String,
    time: i64,
    #[serde(default)]
    tx: Vec<String>,
}

#[async_trait]
impl ChainReader for DaemonClient {
    async fn height(&self) -> Result<u64, ScanError> {
        self.call_as("getblockcount", vec![]).await
    }

    async fn block_hash(&self, height: u64) -> Result<String, ScanError> {
        self.call_as("getblockhash", vec![json!(height)]).await
    }

    async fn block(&self, hash: &str) -> Result<BlockSummary, ScanError> {
        let block: GetBlock = self.call_as("getblock", vec![json!(hash), json!(1)]).await?;
        Ok(BlockSummary {
            height: block.height,
            hash: block.hash,
            time: block.time,
            txids: block.tx,
        })
    }

    async fn raw_transaction(&self, txid: &str) -> Result<RawTransaction, ScanError> {
        self.call_as("getrawtransaction", vec![json!(txid), json!(1)])
            .await
    }
}
