//! Per-transaction matcher.
//!
//! Resolves a decoded transaction against the index: inputs against
//! previously indexed outputs (spend and double-spend detection), outputs
//! against tracked loose addresses and HD accounts, expanding an account's
//! derived window whenever usage reaches into its gap limit.

use crate::dedup::DedupCache;
use crate::{Error, Result};
use bitcoin::{Address, Network, OutPoint, Transaction, Txid};
use chainwatch_primitives::{derive_addresses, parse_xpub, Chain, GapLimits};
use chainwatch_storage::{
    HdAccountAddresses, NewInput, NewOutput, NewTransaction, Store, TransactionDetails,
};
use std::collections::HashMap;

/// Result of matching one relevant transaction.
pub(crate) struct TxCheck {
    /// The stored, annotated record, for downstream notification.
    pub details: TransactionDetails,
}

/// One output of the transaction under examination, grouped by address.
#[derive(Debug, Clone)]
struct IndexedOutput {
    index: u32,
    amount: u64,
    script: Vec<u8>,
}

pub(crate) struct TxMatcher<'a> {
    tx: &'a Transaction,
    txid: Txid,
    store: &'a dyn Store,
    dedup: &'a DedupCache,
    gap_limits: GapLimits,
    network: Network,
    stored_txn_id: Option<i64>,
    relevant: bool,
}

impl<'a> TxMatcher<'a> {
    pub(crate) fn new(
        tx: &'a Transaction,
        store: &'a dyn Store,
        dedup: &'a DedupCache,
        gap_limits: GapLimits,
        network: Network,
    ) -> Self {
        Self {
            tx,
            txid: tx.compute_txid(),
            store,
            dedup,
            gap_limits,
            network,
            stored_txn_id: None,
            relevant: false,
        }
    }

    /// Registers the transaction in the index if it touches a tracked
    /// entity. Returns `None` for irrelevant transactions.
    pub(crate) async fn check(mut self) -> Result<Option<TxCheck>> {
        self.process_inputs().await?;
        self.process_outputs().await?;

        // Remember the txid whether or not it turned out relevant, so the
        // next sighting skips straight through the prefilter.
        self.dedup.insert(self.txid);

        if !self.relevant {
            return Ok(None);
        }

        let details = self
            .store
            .transaction_details(&self.txid)
            .await?
            .ok_or_else(|| Error::Inconsistent(format!("stored transaction {} vanished", self.txid)))?;

        Ok(Some(TxCheck { details }))
    }

    /// Resolves inputs against indexed outputs, recording spends and
    /// evicting double-spent predecessors.
    async fn process_inputs(&mut self) -> Result<()> {
        let mut outpoints = Vec::new();
        let mut input_index_by_outpoint: HashMap<OutPoint, usize> = HashMap::new();

        for (index, input) in self.tx.input.iter().enumerate() {
            if input.previous_output.is_null() {
                continue;
            }
            outpoints.push(input.previous_output);
            input_index_by_outpoint.insert(input.previous_output, index);
        }

        if outpoints.is_empty() {
            return Ok(());
        }

        let spends = self.store.output_spends(&outpoints).await?;
        if spends.is_empty() {
            return Ok(());
        }

        // Value is leaving tracked addresses.
        self.relevant = true;
        let txn_id = self.ensure_transaction().await?;

        let mut new_inputs = Vec::new();
        let mut double_spent_ids = Vec::new();

        for spend in &spends {
            let input_index = input_index_by_outpoint[&spend.outpoint()];

            new_inputs.push(NewInput {
                txn_id,
                output_id: spend.output_id,
                index: input_index as u32,
                sequence: self.tx.input[input_index].sequence.to_consensus_u32(),
            });

            if let Some(spender) = spend.spending_txn_id {
                if spender != txn_id {
                    tracing::warn!(
                        outpoint = %spend.outpoint(),
                        txid = %self.txid,
                        "Double spend detected, evicting previous spender"
                    );
                    double_spent_ids.push(spender);
                }
            }
        }

        self.store.insert_inputs(&new_inputs).await?;

        if !double_spent_ids.is_empty() {
            double_spent_ids.sort_unstable();
            double_spent_ids.dedup();
            // The loser leaves the index entirely; block confirmation and
            // rewind settle which branch was canonical.
            let evicted = self
                .store
                .delete_transactions_by_ids(&double_spent_ids)
                .await?;
            for txid in evicted {
                self.dedup.remove(&txid);
            }
        }

        Ok(())
    }

    /// Resolves outputs against tracked loose addresses and HD accounts.
    async fn process_outputs(&mut self) -> Result<()> {
        let mut indexed: HashMap<String, Vec<IndexedOutput>> = HashMap::new();

        for (index, output) in self.tx.output.iter().enumerate() {
            if let Ok(address) = Address::from_script(&output.script_pubkey, self.network) {
                indexed.entry(address.to_string()).or_default().push(IndexedOutput {
                    index: index as u32,
                    amount: output.value.to_sat(),
                    script: output.script_pubkey.to_bytes(),
                });
            }
        }

        if indexed.is_empty() {
            return Ok(());
        }

        let addresses: Vec<String> = indexed.keys().cloned().collect();
        let owners = self.store.address_owners(&addresses).await?;

        // (address row id, output) pairs to persist.
        let mut funded: Vec<(i64, IndexedOutput)> = Vec::new();

        for record in &owners.loose {
            if let Some(outputs) = indexed.get(&record.address) {
                funded.extend(outputs.iter().map(|o| (record.id, o.clone())));
            }
        }

        for entry in &owners.hd {
            let used_new = self.expand_gap_window(entry, &indexed).await?;

            let mut account_addresses = entry.addresses.clone();
            if !used_new.is_empty() {
                account_addresses.extend(self.store.get_addresses(&used_new).await?);
            }

            for record in &account_addresses {
                if let Some(outputs) = indexed.get(&record.address) {
                    funded.extend(outputs.iter().map(|o| (record.id, o.clone())));
                }
            }
        }

        if funded.is_empty() {
            return Ok(());
        }

        self.relevant = true;
        let txn_id = self.ensure_transaction().await?;

        let new_outputs: Vec<NewOutput> = funded
            .into_iter()
            .map(|(address_id, output)| NewOutput {
                txn_id,
                address_id,
                index: output.index,
                amount: output.amount,
                script: output.script,
            })
            .collect();

        self.store.insert_outputs(&new_outputs).await?;

        Ok(())
    }

    /// Re-establishes the gap-limit invariant for every chain of one HD
    /// account touched by this transaction.
    ///
    /// Derivation is an explicit loop: a freshly derived address may itself
    /// appear among this transaction's outputs, pushing the used frontier
    /// further out and requiring another round.
    ///
    /// Returns the addresses of this transaction that were only discovered
    /// through derivation.
    async fn expand_gap_window(
        &self,
        entry: &HdAccountAddresses,
        indexed: &HashMap<String, Vec<IndexedOutput>>,
    ) -> Result<Vec<String>> {
        let account = &entry.account;
        let xpub = parse_xpub(&account.xpub, self.network)?;

        let mut used_new: Vec<String> = Vec::new();
        let mut derived_batch = Vec::new();

        for chain in Chain::ALL {
            let gap_limit = self.gap_limits.for_chain(chain);

            let Some(mut max_used) = entry
                .addresses
                .iter()
                .filter_map(|a| a.hd.filter(|hd| hd.chain == chain).map(|hd| hd.index))
                .max()
            else {
                continue;
            };

            // Usage below the unused frontier cannot advance the window.
            let next_unused = self.store.hd_next_unused_index(account.id, chain).await?;
            if max_used < next_unused {
                continue;
            }

            let mut max_derived = self.store.hd_max_derived_index(account.id, chain).await?;

            if max_derived.is_some_and(|derived| derived >= max_used + gap_limit) {
                // The window looks wide enough; make sure it has no holes.
                let forward = self
                    .store
                    .hd_derived_count_in_range(account.id, chain, max_used, max_used + gap_limit)
                    .await?;
                if forward >= gap_limit + 1 {
                    continue;
                }
                tracing::warn!(
                    account = account.id,
                    %chain,
                    max_used,
                    "Hole in derived window, forcing re-derivation"
                );
                max_derived = Some(max_used);
            }

            loop {
                let from = max_derived.map(|d| d + 1).unwrap_or(0);
                let to = max_used + gap_limit;
                if from > to {
                    break;
                }

                let derived =
                    derive_addresses(&xpub, chain, from..=to, account.scheme, self.network)?;
                tracing::info!(
                    account = account.id,
                    %chain,
                    from,
                    to,
                    "Derived {} addresses",
                    derived.len()
                );
                max_derived = Some(to);

                let mut advanced = false;
                for derived_addr in &derived {
                    if indexed.contains_key(&derived_addr.address) {
                        tracing::info!(
                            account = account.id,
                            %chain,
                            index = derived_addr.index,
                            "Derived address already funded by this transaction"
                        );
                        max_used = max_used.max(derived_addr.index);
                        used_new.push(derived_addr.address.clone());
                        advanced = true;
                    }
                }
                derived_batch.extend(derived);

                if !advanced {
                    break;
                }
            }
        }

        if !derived_batch.is_empty() {
            self.store
                .insert_derived_addresses(account.id, &derived_batch)
                .await?;
        }

        used_new.sort();
        used_new.dedup();
        Ok(used_new)
    }

    /// Stores the transaction row once, on first relevance.
    async fn ensure_transaction(&mut self) -> Result<i64> {
        if let Some(id) = self.stored_txn_id {
            return Ok(id);
        }
        let id = self
            .store
            .ensure_transaction(&NewTransaction {
                txid: self.txid,
                version: self.tx.version.0,
                locktime: self.tx.lock_time.to_consensus_u32(),
            })
            .await?;
        tracing::info!(txid = %self.txid, "Storing transaction");
        self.stored_txn_id = Some(id);
        Ok(id)
    }
}
