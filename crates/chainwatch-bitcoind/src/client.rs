//! JSON-RPC client for the Bitcoin daemon.

use crate::types::{BlockchainInfo, BlockHeaderInfo, RawTransactionInfo};
use crate::BitcoindRpc;
use bitcoin::consensus::Decodable;
use bitcoin::{Block, BlockHash, Txid};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// RPC error code bitcoind returns for an unknown transaction or block.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// Daemon client error type.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Daemon error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Daemon returned neither result nor error")]
    MissingResult,

    #[error("Invalid hex in daemon response: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    BitcoinEncode(#[from] bitcoin::consensus::encode::Error),
}

impl RpcError {
    /// True when the daemon reported that it does not know the requested
    /// object (gone from the mempool, unknown block hash).
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Rpc { code, .. } if *code == RPC_INVALID_ADDRESS_OR_KEY)
    }
}

/// Connection settings for the daemon RPC interface.
#[derive(Debug, Clone)]
pub struct BitcoindConfig {
    /// Base URL of the RPC endpoint, e.g. `http://127.0.0.1:8332`.
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Client for the daemon's JSON-RPC interface.
pub struct BitcoindClient {
    client: Client,
    config: BitcoindConfig,
}

impl BitcoindClient {
    /// Creates a new instance of [`BitcoindClient`].
    pub fn new(config: BitcoindConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Polls `getblockchaininfo` until the daemon answers, retrying with a
    /// fixed delay. Used at startup, where an unreachable daemon is not
    /// fatal.
    pub async fn wait_until_ready(&self, retry_delay: Duration) -> BlockchainInfo {
        loop {
            match self.blockchain_info().await {
                Ok(info) => return info,
                Err(err) => {
                    tracing::warn!(
                        retry_in = ?retry_delay,
                        "Daemon not ready: {err}"
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "chainwatch",
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.config.rpc_url).json(&body);
        if let Some(user) = &self.config.rpc_user {
            request = request.basic_auth(user, self.config.rpc_password.as_deref());
        }

        let response: RpcResponse<T> = request.send().await?.json().await?;

        match (response.result, response.error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            }),
            (None, None) => Err(RpcError::MissingResult),
        }
    }
}

#[async_trait::async_trait]
impl BitcoindRpc for BitcoindClient {
    async fn blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.call("getblockchaininfo", serde_json::json!([])).await
    }

    async fn block_hash(&self, height: u32) -> Result<BlockHash, RpcError> {
        self.call("getblockhash", serde_json::json!([height])).await
    }

    async fn block_header(&self, hash: &BlockHash) -> Result<BlockHeaderInfo, RpcError> {
        self.call("getblockheader", serde_json::json!([hash, true]))
            .await
    }

    async fn raw_block(&self, hash: &BlockHash) -> Result<Block, RpcError> {
        let hex: String = self.call("getblock", serde_json::json!([hash, 0])).await?;
        let raw = hex::decode(hex)?;
        let block = Block::consensus_decode(&mut raw.as_slice())?;
        Ok(block)
    }

    async fn raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo, RpcError> {
        self.call("getrawtransaction", serde_json::json!([txid, true]))
            .await
    }
}
