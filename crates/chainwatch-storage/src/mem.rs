//! In-memory store backing the test suites.

use crate::{
    AddressOwners, AddressRecord, BlockRecord, BlockRef, Error, HdAccountAddresses,
    HdAccountRecord, HdMembership, HdOrigin, InputDetail, NewBlock, NewInput, NewOutput,
    NewTransaction, OutputDetail, OutputSpend, Result, Store, TransactionDetails,
    TransactionRecord, UnspentOutput,
};
use bitcoin::{BlockHash, OutPoint, Txid};
use chainwatch_primitives::{Chain, DerivationScheme, DerivedAddress};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct AddrRow {
    id: i64,
    address: String,
    hd: Option<HdMembership>,
}

#[derive(Debug, Clone)]
struct AccountRow {
    id: i64,
    xpub: String,
    scheme: DerivationScheme,
}

#[derive(Debug, Clone)]
struct BlockRow {
    id: i64,
    height: u32,
    hash: BlockHash,
    time: u32,
    parent_id: Option<i64>,
}

#[derive(Debug, Clone)]
struct TxRow {
    id: i64,
    txid: Txid,
    version: i32,
    locktime: u32,
    block_id: Option<i64>,
}

#[derive(Debug, Clone)]
struct OutRow {
    id: i64,
    txn_id: i64,
    address_id: i64,
    index: u32,
    amount: u64,
}

#[derive(Debug, Clone)]
struct InRow {
    txn_id: i64,
    output_id: i64,
    index: u32,
    sequence: u32,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    addresses: Vec<AddrRow>,
    accounts: Vec<AccountRow>,
    blocks: Vec<BlockRow>,
    transactions: Vec<TxRow>,
    outputs: Vec<OutRow>,
    inputs: Vec<InRow>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn delete_transaction_rows(&mut self, txn_id: i64) {
        let removed_outputs: Vec<i64> = self
            .outputs
            .iter()
            .filter(|o| o.txn_id == txn_id)
            .map(|o| o.id)
            .collect();
        self.outputs.retain(|o| o.txn_id != txn_id);
        self.inputs
            .retain(|i| i.txn_id != txn_id && !removed_outputs.contains(&i.output_id));
        self.transactions.retain(|t| t.id != txn_id);
    }

    fn membership_of(&self, address_id: i64) -> (String, Option<HdOrigin>) {
        let addr = self
            .addresses
            .iter()
            .find(|a| a.id == address_id)
            .expect("output references a tracked address");
        let origin = addr.hd.and_then(|hd| {
            self.accounts
                .iter()
                .find(|acct| acct.id == hd.account_id)
                .map(|acct| HdOrigin {
                    xpub: acct.xpub.clone(),
                    chain: hd.chain,
                    index: hd.index,
                })
        });
        (addr.address.clone(), origin)
    }
}

/// A [`Store`] holding everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn ensure_loose_address(&self, address: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.addresses.iter().find(|a| a.address == address) {
            return Ok(row.id);
        }
        let id = inner.next_id();
        inner.addresses.push(AddrRow {
            id,
            address: address.to_owned(),
            hd: None,
        });
        Ok(id)
    }

    async fn known_addresses(&self, addresses: &[String]) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .addresses
            .iter()
            .filter(|a| addresses.contains(&a.address))
            .map(|a| a.address.clone())
            .collect())
    }

    async fn get_addresses(&self, addresses: &[String]) -> Result<Vec<AddressRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .addresses
            .iter()
            .filter(|a| addresses.contains(&a.address))
            .map(|a| AddressRecord {
                id: a.id,
                address: a.address.clone(),
                hd: a.hd,
            })
            .collect())
    }

    async fn address_owners(&self, addresses: &[String]) -> Result<AddressOwners> {
        let inner = self.inner.lock();
        let mut owners = AddressOwners::default();
        for row in inner
            .addresses
            .iter()
            .filter(|a| addresses.contains(&a.address))
        {
            let record = AddressRecord {
                id: row.id,
                address: row.address.clone(),
                hd: row.hd,
            };
            match row.hd {
                Some(hd) => {
                    let account = inner
                        .accounts
                        .iter()
                        .find(|acct| acct.id == hd.account_id)
                        .ok_or_else(|| Error::Corrupt("dangling account reference".into()))?;
                    match owners
                        .hd
                        .iter_mut()
                        .find(|entry| entry.account.id == account.id)
                    {
                        Some(entry) => entry.addresses.push(record),
                        None => owners.hd.push(HdAccountAddresses {
                            account: HdAccountRecord {
                                id: account.id,
                                xpub: account.xpub.clone(),
                                scheme: account.scheme,
                                locked: false,
                                created: 0,
                            },
                            addresses: vec![record],
                        }),
                    }
                }
                None => owners.loose.push(record),
            }
        }
        Ok(owners)
    }

    async fn ensure_hd_account(&self, xpub: &str, scheme: DerivationScheme) -> Result<i64> {
        let mut inner = self.inner.lock();
        if let Some(acct) = inner.accounts.iter().find(|a| a.xpub == xpub) {
            return Ok(acct.id);
        }
        let id = inner.next_id();
        inner.accounts.push(AccountRow {
            id,
            xpub: xpub.to_owned(),
            scheme,
        });
        Ok(id)
    }

    async fn hd_account_by_xpub(&self, xpub: &str) -> Result<Option<HdAccountRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .accounts
            .iter()
            .find(|a| a.xpub == xpub)
            .map(|a| HdAccountRecord {
                id: a.id,
                xpub: a.xpub.clone(),
                scheme: a.scheme,
                locked: false,
                created: 0,
            }))
    }

    async fn hd_next_unused_index(&self, account_id: i64, chain: Chain) -> Result<u32> {
        let inner = self.inner.lock();
        let max_used = inner
            .addresses
            .iter()
            .filter_map(|a| match a.hd {
                Some(hd) if hd.account_id == account_id && hd.chain == chain => {
                    let funded = inner.outputs.iter().any(|o| o.address_id == a.id);
                    funded.then_some(hd.index)
                }
                _ => None,
            })
            .max();
        Ok(max_used.map(|m| m + 1).unwrap_or(0))
    }

    async fn hd_max_derived_index(&self, account_id: i64, chain: Chain) -> Result<Option<u32>> {
        let inner = self.inner.lock();
        Ok(inner
            .addresses
            .iter()
            .filter_map(|a| match a.hd {
                Some(hd) if hd.account_id == account_id && hd.chain == chain => Some(hd.index),
                _ => None,
            })
            .max())
    }

    async fn hd_derived_count_in_range(
        &self,
        account_id: i64,
        chain: Chain,
        min: u32,
        max: u32,
    ) -> Result<u32> {
        let inner = self.inner.lock();
        Ok(inner
            .addresses
            .iter()
            .filter(|a| match a.hd {
                Some(hd) => {
                    hd.account_id == account_id
                        && hd.chain == chain
                        && hd.index >= min
                        && hd.index <= max
                }
                None => false,
            })
            .count() as u32)
    }

    async fn insert_derived_addresses(
        &self,
        account_id: i64,
        derived: &[DerivedAddress],
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        for addr in derived {
            if inner.addresses.iter().any(|a| a.address == addr.address) {
                continue;
            }
            let id = inner.next_id();
            inner.addresses.push(AddrRow {
                id,
                address: addr.address.clone(),
                hd: Some(HdMembership {
                    account_id,
                    chain: addr.chain,
                    index: addr.index,
                }),
            });
        }
        Ok(())
    }

    async fn insert_block(&self, block: &NewBlock) -> Result<i64> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.blocks.iter().find(|b| b.hash == block.hash) {
            return Ok(row.id);
        }
        let id = inner.next_id();
        inner.blocks.push(BlockRow {
            id,
            height: block.height,
            hash: block.hash,
            time: block.time,
            parent_id: block.parent_id,
        });
        Ok(id)
    }

    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .blocks
            .iter()
            .find(|b| b.hash == *hash)
            .map(|b| BlockRecord {
                id: b.id,
                height: b.height,
                hash: b.hash,
                time: b.time,
                parent_id: b.parent_id,
            }))
    }

    async fn highest_block(&self) -> Result<Option<BlockRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .blocks
            .iter()
            .max_by_key(|b| b.height)
            .map(|b| BlockRecord {
                id: b.id,
                height: b.height,
                hash: b.hash,
                time: b.time,
                parent_id: b.parent_id,
            }))
    }

    async fn delete_blocks_above(&self, height: u32) -> Result<u64> {
        let mut inner = self.inner.lock();
        let removed: Vec<i64> = inner
            .blocks
            .iter()
            .filter(|b| b.height > height)
            .map(|b| b.id)
            .collect();
        inner.blocks.retain(|b| b.height <= height);
        for tx in &mut inner.transactions {
            if let Some(block_id) = tx.block_id {
                if removed.contains(&block_id) {
                    tx.block_id = None;
                }
            }
        }
        Ok(removed.len() as u64)
    }

    async fn ensure_transaction(&self, tx: &NewTransaction) -> Result<i64> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.transactions.iter().find(|t| t.txid == tx.txid) {
            return Ok(row.id);
        }
        let id = inner.next_id();
        inner.transactions.push(TxRow {
            id,
            txid: tx.txid,
            version: tx.version,
            locktime: tx.locktime,
            block_id: None,
        });
        Ok(id)
    }

    async fn transaction_record(&self, txid: &Txid) -> Result<Option<TransactionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .transactions
            .iter()
            .find(|t| t.txid == *txid)
            .map(|t| TransactionRecord {
                id: t.id,
                txid: t.txid,
                version: t.version,
                locktime: t.locktime,
                block_id: t.block_id,
            }))
    }

    async fn transaction_details(&self, txid: &Txid) -> Result<Option<TransactionDetails>> {
        let inner = self.inner.lock();
        let Some(tx) = inner.transactions.iter().find(|t| t.txid == *txid) else {
            return Ok(None);
        };

        let confirmed = tx.block_id.and_then(|block_id| {
            inner
                .blocks
                .iter()
                .find(|b| b.id == block_id)
                .map(|b| BlockRef {
                    height: b.height,
                    hash: b.hash,
                    time: b.time,
                })
        });

        let mut outputs: Vec<OutputDetail> = inner
            .outputs
            .iter()
            .filter(|o| o.txn_id == tx.id)
            .map(|o| {
                let (address, origin) = inner.membership_of(o.address_id);
                OutputDetail {
                    index: o.index,
                    amount: o.amount,
                    address,
                    origin,
                }
            })
            .collect();
        outputs.sort_by_key(|o| o.index);

        let mut inputs: Vec<InputDetail> = inner
            .inputs
            .iter()
            .filter(|i| i.txn_id == tx.id)
            .map(|i| {
                let output = inner
                    .outputs
                    .iter()
                    .find(|o| o.id == i.output_id)
                    .expect("input references an indexed output");
                let funding = inner
                    .transactions
                    .iter()
                    .find(|t| t.id == output.txn_id)
                    .expect("output references an indexed transaction");
                let (address, origin) = inner.membership_of(output.address_id);
                InputDetail {
                    index: i.index,
                    sequence: i.sequence,
                    outpoint: OutPoint {
                        txid: funding.txid,
                        vout: output.index,
                    },
                    amount: output.amount,
                    address,
                    origin,
                }
            })
            .collect();
        inputs.sort_by_key(|i| i.index);

        Ok(Some(TransactionDetails {
            txid: tx.txid,
            version: tx.version,
            locktime: tx.locktime,
            confirmed,
            inputs,
            outputs,
        }))
    }

    async fn transactions_by_ids(&self, ids: &[i64]) -> Result<Vec<TransactionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .transactions
            .iter()
            .filter(|t| ids.contains(&t.id))
            .map(|t| TransactionRecord {
                id: t.id,
                txid: t.txid,
                version: t.version,
                locktime: t.locktime,
                block_id: t.block_id,
            })
            .collect())
    }

    async fn confirm_transactions(&self, txids: &[Txid], block_id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        for tx in &mut inner.transactions {
            if txids.contains(&tx.txid) {
                tx.block_id = Some(block_id);
            }
        }
        Ok(())
    }

    async fn unconfirm_transactions(&self, txids: &[Txid]) -> Result<()> {
        let mut inner = self.inner.lock();
        for tx in &mut inner.transactions {
            if txids.contains(&tx.txid) {
                tx.block_id = None;
            }
        }
        Ok(())
    }

    async fn transactions_confirmed_above(&self, height: u32) -> Result<Vec<TransactionRecord>> {
        let inner = self.inner.lock();
        let deep_blocks: Vec<i64> = inner
            .blocks
            .iter()
            .filter(|b| b.height > height)
            .map(|b| b.id)
            .collect();
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.block_id.is_some_and(|id| deep_blocks.contains(&id)))
            .map(|t| TransactionRecord {
                id: t.id,
                txid: t.txid,
                version: t.version,
                locktime: t.locktime,
                block_id: t.block_id,
            })
            .collect())
    }

    async fn unconfirmed_transactions(&self) -> Result<Vec<TransactionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.block_id.is_none())
            .map(|t| TransactionRecord {
                id: t.id,
                txid: t.txid,
                version: t.version,
                locktime: t.locktime,
                block_id: t.block_id,
            })
            .collect())
    }

    async fn delete_transaction(&self, txid: &Txid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner
            .transactions
            .iter()
            .find(|t| t.txid == *txid)
            .map(|t| t.id)
        {
            inner.delete_transaction_rows(id);
        }
        Ok(())
    }

    async fn delete_transactions_by_ids(&self, ids: &[i64]) -> Result<Vec<Txid>> {
        let mut inner = self.inner.lock();
        let mut deleted = Vec::new();
        for &id in ids {
            if let Some(txid) = inner
                .transactions
                .iter()
                .find(|t| t.id == id)
                .map(|t| t.txid)
            {
                inner.delete_transaction_rows(id);
                deleted.push(txid);
            }
        }
        Ok(deleted)
    }

    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<()> {
        let mut inner = self.inner.lock();
        for output in outputs {
            if inner
                .outputs
                .iter()
                .any(|o| o.txn_id == output.txn_id && o.index == output.index)
            {
                continue;
            }
            let id = inner.next_id();
            inner.outputs.push(OutRow {
                id,
                txn_id: output.txn_id,
                address_id: output.address_id,
                index: output.index,
                amount: output.amount,
            });
        }
        Ok(())
    }

    async fn insert_inputs(&self, inputs: &[NewInput]) -> Result<()> {
        let mut inner = self.inner.lock();
        for input in inputs {
            match inner
                .inputs
                .iter_mut()
                .find(|i| i.txn_id == input.txn_id && i.output_id == input.output_id)
            {
                Some(existing) => {
                    existing.index = input.index;
                    existing.sequence = input.sequence;
                }
                None => inner.inputs.push(InRow {
                    txn_id: input.txn_id,
                    output_id: input.output_id,
                    index: input.index,
                    sequence: input.sequence,
                }),
            }
        }
        Ok(())
    }

    async fn output_spends(&self, outpoints: &[OutPoint]) -> Result<Vec<OutputSpend>> {
        let inner = self.inner.lock();
        let mut spends = Vec::new();
        for outpoint in outpoints {
            let Some(funding) = inner
                .transactions
                .iter()
                .find(|t| t.txid == outpoint.txid)
            else {
                continue;
            };
            let Some(output) = inner
                .outputs
                .iter()
                .find(|o| o.txn_id == funding.id && o.index == outpoint.vout)
            else {
                continue;
            };
            let (address, _) = inner.membership_of(output.address_id);
            let spending_txn_id = inner
                .inputs
                .iter()
                .find(|i| i.output_id == output.id)
                .map(|i| i.txn_id);
            spends.push(OutputSpend {
                output_id: output.id,
                funding_txid: outpoint.txid,
                vout: outpoint.vout,
                address,
                amount: output.amount,
                spending_txn_id,
            });
        }
        Ok(spends)
    }

    async fn known_outpoints(&self, outpoints: &[OutPoint]) -> Result<Vec<OutPoint>> {
        let inner = self.inner.lock();
        Ok(outpoints
            .iter()
            .filter(|outpoint| {
                inner
                    .transactions
                    .iter()
                    .find(|t| t.txid == outpoint.txid)
                    .map(|funding| {
                        inner
                            .outputs
                            .iter()
                            .any(|o| o.txn_id == funding.id && o.index == outpoint.vout)
                    })
                    .unwrap_or(false)
            })
            .copied()
            .collect())
    }

    async fn unspent_outputs(&self, addresses: &[String]) -> Result<Vec<UnspentOutput>> {
        let inner = self.inner.lock();
        let mut unspent = Vec::new();
        for output in &inner.outputs {
            if inner.inputs.iter().any(|i| i.output_id == output.id) {
                continue;
            }
            let (address, _) = inner.membership_of(output.address_id);
            if !addresses.contains(&address) {
                continue;
            }
            let funding = inner
                .transactions
                .iter()
                .find(|t| t.id == output.txn_id)
                .expect("output references an indexed transaction");
            let height = funding.block_id.and_then(|block_id| {
                inner
                    .blocks
                    .iter()
                    .find(|b| b.id == block_id)
                    .map(|b| b.height)
            });
            unspent.push(UnspentOutput {
                txid: funding.txid,
                vout: output.index,
                address,
                amount: output.amount,
                height,
            });
        }
        Ok(unspent)
    }
}
