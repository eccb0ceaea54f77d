//! Storage contract for the chainwatch index.
//!
//! The tracker engine only ever talks to [`Store`]; the backing engine is
//! interchangeable. [`SqliteStore`] is the production implementation,
//! [`MemoryStore`] backs the test suites.

mod mem;
mod records;
mod sqlite;

pub use mem::MemoryStore;
pub use records::*;
pub use sqlite::SqliteStore;

use bitcoin::{BlockHash, OutPoint, Txid};
use chainwatch_primitives::{Chain, DerivationScheme, DerivedAddress};
use std::sync::Arc;

/// Storage error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shared handle to a store implementation.
pub type StoreHandle = Arc<dyn Store>;

/// The index storage contract.
///
/// Insertions are idempotent on their natural keys (address string, block
/// hash, txid, `(txn, vout)` for outputs, `(txn, output)` for inputs);
/// repeating an ingestion must not create duplicate rows.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ---- Addresses

    /// Inserts a loose tracked address, returning its id. Re-inserting an
    /// existing address returns the existing id.
    async fn ensure_loose_address(&self, address: &str) -> Result<i64>;

    /// Returns the subset of `addresses` that are already tracked.
    async fn known_addresses(&self, addresses: &[String]) -> Result<Vec<String>>;

    /// Returns the full rows for the given tracked addresses.
    async fn get_addresses(&self, addresses: &[String]) -> Result<Vec<AddressRecord>>;

    /// Groups the tracked owners of the given addresses into loose
    /// addresses and HD accounts.
    async fn address_owners(&self, addresses: &[String]) -> Result<AddressOwners>;

    // ---- HD accounts

    /// Inserts an HD account, returning its id. Idempotent by xpub.
    async fn ensure_hd_account(&self, xpub: &str, scheme: DerivationScheme) -> Result<i64>;

    async fn hd_account_by_xpub(&self, xpub: &str) -> Result<Option<HdAccountRecord>>;

    /// Next unused index on a chain: one past the highest derived index
    /// holding at least one indexed output, or 0 when none is used.
    async fn hd_next_unused_index(&self, account_id: i64, chain: Chain) -> Result<u32>;

    /// Highest derived index on a chain, `None` when nothing was derived.
    async fn hd_max_derived_index(&self, account_id: i64, chain: Chain) -> Result<Option<u32>>;

    /// Number of derived indices within `min..=max` on a chain. Used to
    /// detect holes in the derived window.
    async fn hd_derived_count_in_range(
        &self,
        account_id: i64,
        chain: Chain,
        min: u32,
        max: u32,
    ) -> Result<u32>;

    /// Persists a batch of derived addresses for an account. Idempotent by
    /// address string.
    async fn insert_derived_addresses(
        &self,
        account_id: i64,
        derived: &[DerivedAddress],
    ) -> Result<()>;

    // ---- Blocks

    /// Inserts a block, returning its id. Inserting an already-known hash
    /// is a no-op returning the existing id.
    async fn insert_block(&self, block: &NewBlock) -> Result<i64>;

    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockRecord>>;

    async fn highest_block(&self) -> Result<Option<BlockRecord>>;

    /// Deletes every block above the given height, returning the number of
    /// rows removed.
    async fn delete_blocks_above(&self, height: u32) -> Result<u64>;

    // ---- Transactions

    /// Inserts a transaction, returning its id. Idempotent by txid.
    async fn ensure_transaction(&self, tx: &NewTransaction) -> Result<i64>;

    async fn transaction_record(&self, txid: &Txid) -> Result<Option<TransactionRecord>>;

    /// Returns the annotated transaction with its indexed inputs/outputs.
    async fn transaction_details(&self, txid: &Txid) -> Result<Option<TransactionDetails>>;

    async fn transactions_by_ids(&self, ids: &[i64]) -> Result<Vec<TransactionRecord>>;

    /// Marks the given transactions as confirmed in `block_id`. Unknown
    /// txids are ignored.
    async fn confirm_transactions(&self, txids: &[Txid], block_id: i64) -> Result<()>;

    /// Clears the confirmation of the given transactions.
    async fn unconfirm_transactions(&self, txids: &[Txid]) -> Result<()>;

    /// Transactions confirmed in blocks strictly above the given height.
    async fn transactions_confirmed_above(&self, height: u32) -> Result<Vec<TransactionRecord>>;

    async fn unconfirmed_transactions(&self) -> Result<Vec<TransactionRecord>>;

    /// Deletes a transaction and its inputs/outputs.
    async fn delete_transaction(&self, txid: &Txid) -> Result<()>;

    /// Deletes transactions by storage id, returning the txids removed.
    async fn delete_transactions_by_ids(&self, ids: &[i64]) -> Result<Vec<Txid>>;

    // ---- Outputs and inputs

    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<()>;

    async fn insert_inputs(&self, inputs: &[NewInput]) -> Result<()>;

    /// For each known outpoint among `outpoints`, returns the output row
    /// and the transaction currently spending it, if any.
    async fn output_spends(&self, outpoints: &[OutPoint]) -> Result<Vec<OutputSpend>>;

    /// Returns the subset of `outpoints` that exist as indexed outputs.
    async fn known_outpoints(&self, outpoints: &[OutPoint]) -> Result<Vec<OutPoint>>;

    /// Unspent indexed outputs paying any of the given addresses.
    async fn unspent_outputs(&self, addresses: &[String]) -> Result<Vec<UnspentOutput>>;
}

/// Statement chunk size for `IN (...)` style batch queries.
pub(crate) const SQL_BATCH_SIZE: usize = 100;
