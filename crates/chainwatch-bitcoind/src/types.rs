//! Serde mappings for the Bitcoin Core JSON-RPC responses we consume.
//!
//! Field names follow the JSON keys returned by the daemon.

use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};

/// Response for `getblockchaininfo`, reduced to the fields the tracker
/// uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainInfo {
    /// Current network name (main, test, signet, regtest).
    pub chain: String,
    /// The number of fully-validated blocks the daemon has.
    pub blocks: u32,
    /// The number of headers the daemon has validated.
    pub headers: u32,
    /// The hash of the currently best block.
    pub bestblockhash: BlockHash,
    /// Whether the daemon itself is still in initial block download.
    #[serde(default)]
    pub initialblockdownload: bool,
}

/// Response for `getblockheader` with verbosity enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeaderInfo {
    /// The block hash.
    pub hash: BlockHash,
    /// The block height.
    pub height: u32,
    /// The block time in UNIX epoch time.
    pub time: u32,
    /// The hash of the previous block. Absent only for genesis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previousblockhash: Option<BlockHash>,
    /// The hash of the next block on the active chain, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nextblockhash: Option<BlockHash>,
    /// The number of confirmations, -1 when not on the active chain.
    #[serde(default)]
    pub confirmations: i64,
}

/// Response for `getrawtransaction` with verbose output, reduced to the
/// confirmation fields used by the mempool reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransactionInfo {
    /// The transaction id.
    pub txid: Txid,
    /// The confirming block hash, absent while in the mempool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockhash: Option<BlockHash>,
    /// The number of confirmations.
    #[serde(default)]
    pub confirmations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_trimmed_blockchain_info() {
        let raw = r#"{
            "chain": "main",
            "blocks": 823714,
            "headers": 823714,
            "bestblockhash": "00000000000000000002c0cc73626b56fb3ee1ce605b0ce125cc4fb58775a0a9",
            "difficulty": 72006146478567.1,
            "initialblockdownload": false,
            "warnings": ""
        }"#;
        let info: BlockchainInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.blocks, 823_714);
        assert!(!info.initialblockdownload);
    }

    #[test]
    fn decodes_header_without_parent() {
        let raw = r#"{
            "hash": "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            "height": 0,
            "time": 1231006505,
            "confirmations": 823715
        }"#;
        let header: BlockHeaderInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(header.height, 0);
        assert!(header.previousblockhash.is_none());
    }

    #[test]
    fn decodes_unconfirmed_transaction_info() {
        let raw = r#"{
            "txid": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            "version": 1,
            "locktime": 0
        }"#;
        let info: RawTransactionInfo = serde_json::from_str(raw).unwrap();
        assert!(info.blockhash.is_none());
        assert_eq!(info.confirmations, 0);
    }
}
