//! Bitcoin daemon collaborators.
//!
//! chainwatch never talks to the P2P network itself; everything it learns
//! about the chain comes from a bitcoind instance through two channels:
//! the JSON-RPC interface (request/response) and the ZeroMQ publishers
//! (`hashblock`, `rawtx` push notifications).

mod client;
mod types;
mod zmq_sub;

pub use client::{BitcoindClient, BitcoindConfig, RpcError};
pub use types::{BlockchainInfo, BlockHeaderInfo, RawTransactionInfo};
pub use zmq_sub::{subscribe, ZmqNotification, ZmqTopic};

use bitcoin::{Block, BlockHash, Txid};

/// Request/response surface of the daemon consumed by the tracker.
///
/// Implemented by [`BitcoindClient`] in production and by test doubles in
/// the engine's test suites.
#[async_trait::async_trait]
pub trait BitcoindRpc: Send + Sync {
    /// `getblockchaininfo`: current block/header heights and best hash.
    async fn blockchain_info(&self) -> Result<BlockchainInfo, RpcError>;

    /// `getblockhash`: maps a height to the hash on the active chain.
    async fn block_hash(&self, height: u32) -> Result<BlockHash, RpcError>;

    /// `getblockheader` (verbose): decoded header plus chain context.
    async fn block_header(&self, hash: &BlockHash) -> Result<BlockHeaderInfo, RpcError>;

    /// `getblock` (verbosity 0): the full raw block.
    async fn raw_block(&self, hash: &BlockHash) -> Result<Block, RpcError>;

    /// `getrawtransaction` (verbose): decoded detail including the
    /// confirming block, if any. Returns [`RpcError::is_not_found`] when
    /// the daemon no longer knows the transaction.
    async fn raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo, RpcError>;
}
