//! Batch relevance prefilter.
//!
//! Before any transaction of a block or mempool flush is fully processed,
//! the whole batch is screened with two storage round trips: one for
//! tracked addresses appearing in outputs, one for indexed outputs
//! referenced by inputs. The filter must never produce a false negative;
//! false positives are eliminated by the matcher afterwards.

use crate::dedup::DedupCache;
use crate::Result;
use bitcoin::{Address, Network, OutPoint, Transaction};
use chainwatch_storage::Store;
use std::collections::HashSet;

/// A batch of raw transactions awaiting relevance testing.
#[derive(Default)]
pub struct TransactionsBundle {
    transactions: Vec<Transaction>,
}

impl TransactionsBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transactions(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }

    pub fn push(&mut self, tx: Transaction) {
        self.transactions.push(tx);
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Swaps the accumulated transactions out, leaving the bundle empty.
    pub fn take(&mut self) -> TransactionsBundle {
        TransactionsBundle {
            transactions: std::mem::take(&mut self.transactions),
        }
    }

    /// Returns the subset of transactions possibly touching a tracked
    /// entity, in batch order. Transactions already in the dedup cache are
    /// skipped entirely.
    pub async fn prefilter(
        &self,
        store: &dyn Store,
        dedup: &DedupCache,
        network: Network,
    ) -> Result<Vec<Transaction>> {
        let candidates: Vec<&Transaction> = self
            .transactions
            .iter()
            .filter(|tx| !dedup.contains(&tx.compute_txid()))
            .collect();

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut addresses: Vec<String> = Vec::new();
        let mut outpoints: Vec<OutPoint> = Vec::new();
        let mut seen_addresses = HashSet::new();
        let mut seen_outpoints = HashSet::new();

        for tx in &candidates {
            for output in &tx.output {
                if let Ok(address) = Address::from_script(&output.script_pubkey, network) {
                    let address = address.to_string();
                    if seen_addresses.insert(address.clone()) {
                        addresses.push(address);
                    }
                }
            }
            for input in &tx.input {
                if input.previous_output.is_null() {
                    continue;
                }
                if seen_outpoints.insert(input.previous_output) {
                    outpoints.push(input.previous_output);
                }
            }
        }

        let known_addresses: HashSet<String> =
            store.known_addresses(&addresses).await?.into_iter().collect();
        let known_outpoints: HashSet<OutPoint> =
            store.known_outpoints(&outpoints).await?.into_iter().collect();

        let filtered = candidates
            .into_iter()
            .filter(|tx| {
                let funds_tracked = tx.output.iter().any(|output| {
                    Address::from_script(&output.script_pubkey, network)
                        .map(|address| known_addresses.contains(&address.to_string()))
                        .unwrap_or(false)
                });
                let spends_indexed = tx
                    .input
                    .iter()
                    .any(|input| known_outpoints.contains(&input.previous_output));
                funds_tracked || spends_indexed
            })
            .cloned()
            .collect();

        Ok(filtered)
    }
}
