//! Record types exchanged through the storage contract.

use bitcoin::{BlockHash, OutPoint, Txid};
use chainwatch_primitives::{Chain, DerivationScheme};
use serde::{Deserialize, Serialize};

/// A tracked address row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub id: i64,
    pub address: String,
    /// Present when the address belongs to a tracked HD account.
    pub hd: Option<HdMembership>,
}

/// Position of a derived address within its HD account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdMembership {
    pub account_id: i64,
    pub chain: Chain,
    pub index: u32,
}

/// A tracked HD account row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdAccountRecord {
    pub id: i64,
    pub xpub: String,
    pub scheme: DerivationScheme,
    pub locked: bool,
    /// Unix timestamp of account creation.
    pub created: u64,
}

/// An indexed block row. Parent references form a singly-linked chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub id: i64,
    pub height: u32,
    pub hash: BlockHash,
    pub time: u32,
    pub parent_id: Option<i64>,
}

/// Block fields supplied on insertion.
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub height: u32,
    pub hash: BlockHash,
    pub time: u32,
    pub parent_id: Option<i64>,
}

/// An indexed transaction row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: i64,
    pub txid: Txid,
    pub version: i32,
    pub locktime: u32,
    /// Id of the confirming block, if any.
    pub block_id: Option<i64>,
}

/// Transaction fields supplied on insertion.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub txid: Txid,
    pub version: i32,
    pub locktime: u32,
}

/// Output fields supplied on insertion.
#[derive(Debug, Clone)]
pub struct NewOutput {
    pub txn_id: i64,
    pub address_id: i64,
    pub index: u32,
    pub amount: u64,
    pub script: Vec<u8>,
}

/// Input fields supplied on insertion. `(txn_id, output_id)` is the
/// identity: re-inserting the pair updates the sequence instead.
#[derive(Debug, Clone)]
pub struct NewInput {
    pub txn_id: i64,
    pub output_id: i64,
    pub index: u32,
    pub sequence: u32,
}

/// Result row of the outpoint-to-spender lookup used for spend detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpend {
    pub output_id: i64,
    /// Transaction that created the output.
    pub funding_txid: Txid,
    pub vout: u32,
    pub address: String,
    pub amount: u64,
    /// Transaction currently recorded as spending the output, if any.
    pub spending_txn_id: Option<i64>,
}

impl OutputSpend {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.funding_txid,
            vout: self.vout,
        }
    }
}

/// An unspent indexed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout: u32,
    pub address: String,
    pub amount: u64,
    /// Height of the confirming block, `None` while unconfirmed.
    pub height: Option<u32>,
}

/// Tracked owners of a set of addresses, split the way the matcher
/// consumes them.
#[derive(Debug, Clone, Default)]
pub struct AddressOwners {
    /// Addresses tracked on their own, outside any HD account.
    pub loose: Vec<AddressRecord>,
    /// Accounts owning at least one of the queried addresses, with the
    /// matching address rows.
    pub hd: Vec<HdAccountAddresses>,
}

impl AddressOwners {
    pub fn is_empty(&self) -> bool {
        self.loose.is_empty() && self.hd.is_empty()
    }
}

/// One HD account together with the queried addresses it owns.
#[derive(Debug, Clone)]
pub struct HdAccountAddresses {
    pub account: HdAccountRecord,
    pub addresses: Vec<AddressRecord>,
}

/// Block reference embedded in an annotated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: u32,
    pub hash: BlockHash,
    pub time: u32,
}

/// HD account annotation attached to an input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdOrigin {
    pub xpub: String,
    pub chain: Chain,
    pub index: u32,
}

/// Indexed input of an annotated transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDetail {
    /// Input position within the spending transaction.
    pub index: u32,
    pub sequence: u32,
    /// Previously indexed output being spent.
    pub outpoint: OutPoint,
    pub amount: u64,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<HdOrigin>,
}

/// Indexed output of an annotated transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDetail {
    pub index: u32,
    pub amount: u64,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<HdOrigin>,
}

/// A fully annotated transaction, as handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub txid: Txid,
    pub version: i32,
    pub locktime: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<BlockRef>,
    pub inputs: Vec<InputDetail>,
    pub outputs: Vec<OutputDetail>,
}
