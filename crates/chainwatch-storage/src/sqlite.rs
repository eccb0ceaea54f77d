//! SQLite-backed store.
//!
//! Transient lock/busy errors are retried with randomized backoff before
//! surfacing to the caller; every other error propagates untouched.

use crate::{
    AddressOwners, AddressRecord, BlockRecord, BlockRef, Error, HdAccountAddresses,
    HdAccountRecord, HdMembership, InputDetail, HdOrigin, NewBlock, NewInput, NewOutput,
    NewTransaction, OutputDetail, OutputSpend, Result, Store, TransactionDetails,
    TransactionRecord, UnspentOutput, SQL_BATCH_SIZE,
};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};
use chainwatch_primitives::{Chain, DerivationScheme, DerivedAddress};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

/// Maximum automatic retries for a transient database error.
const MAX_TRANSIENT_RETRIES: u32 = 5;

/// Base backoff before the first retry.
const RETRY_BASE_DELAY_MS: u64 = 20;

/// SQLite implementation of the [`Store`] contract.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens or creates the index database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .pragma("synchronous", "NORMAL");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        Ok(store)
    }

    /// Opens a throwaway in-process database. Test use.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS hd_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                xpub TEXT NOT NULL UNIQUE,
                scheme_code INTEGER NOT NULL,
                created INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL UNIQUE,
                account_id INTEGER REFERENCES hd_accounts(id) ON DELETE CASCADE,
                hd_chain INTEGER,
                hd_index INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_addresses_account
                ON addresses(account_id, hd_chain, hd_index);

            CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                height INTEGER NOT NULL,
                hash BLOB NOT NULL UNIQUE,
                time INTEGER NOT NULL,
                parent_id INTEGER REFERENCES blocks(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_blocks_height ON blocks(height);

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                txid BLOB NOT NULL UNIQUE,
                version INTEGER NOT NULL,
                locktime INTEGER NOT NULL,
                block_id INTEGER REFERENCES blocks(id) ON DELETE SET NULL,
                created INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions(block_id);

            CREATE TABLE IF NOT EXISTS outputs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                txn_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                address_id INTEGER NOT NULL REFERENCES addresses(id),
                out_index INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                script BLOB NOT NULL,
                UNIQUE (txn_id, out_index)
            );
            CREATE INDEX IF NOT EXISTS idx_outputs_address ON outputs(address_id);

            CREATE TABLE IF NOT EXISTS inputs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                txn_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                output_id INTEGER NOT NULL REFERENCES outputs(id) ON DELETE CASCADE,
                in_index INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                UNIQUE (txn_id, output_id)
            );
            CREATE INDEX IF NOT EXISTS idx_inputs_output ON inputs(output_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Runs `op`, retrying on transient lock/busy conditions with
    /// randomized exponential backoff.
    async fn retrying<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    let backoff = RETRY_BASE_DELAY_MS * 2u64.pow(attempt.min(4));
                    let delay = backoff + fastrand::u64(0..=backoff / 2);
                    tracing::warn!(attempt, delay_ms = delay, "Transient database error: {err}");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn txid_from_blob(bytes: &[u8]) -> Result<Txid> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Corrupt(format!("txid blob of length {}", bytes.len())))?;
    Ok(Txid::from_byte_array(arr))
}

fn block_hash_from_blob(bytes: &[u8]) -> Result<BlockHash> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Corrupt(format!("block hash blob of length {}", bytes.len())))?;
    Ok(BlockHash::from_byte_array(arr))
}

fn membership(account_id: Option<i64>, chain: Option<i64>, index: Option<i64>) -> Option<HdMembership> {
    match (account_id, chain, index) {
        (Some(account_id), Some(chain), Some(index)) => Some(HdMembership {
            account_id,
            chain: Chain::from_index(chain as u32)?,
            index: index as u32,
        }),
        _ => None,
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

fn outpoint_values(n: usize) -> String {
    let mut s = String::with_capacity(n * 6);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push_str("(?,?)");
    }
    s
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn ensure_loose_address(&self, address: &str) -> Result<i64> {
        self.retrying(|| async {
            sqlx::query("INSERT INTO addresses (address) VALUES (?) ON CONFLICT(address) DO NOTHING")
                .bind(address)
                .execute(&self.pool)
                .await?;
            let (id,): (i64,) = sqlx::query_as("SELECT id FROM addresses WHERE address = ?")
                .bind(address)
                .fetch_one(&self.pool)
                .await?;
            Ok(id)
        })
        .await
    }

    async fn known_addresses(&self, addresses: &[String]) -> Result<Vec<String>> {
        let mut known = Vec::new();
        for chunk in addresses.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "SELECT address FROM addresses WHERE address IN ({})",
                placeholders(chunk.len())
            );
            let rows: Vec<(String,)> = self
                .retrying(|| async {
                    let mut query = sqlx::query_as(&sql);
                    for address in chunk {
                        query = query.bind(address);
                    }
                    query.fetch_all(&self.pool).await
                })
                .await?;
            known.extend(rows.into_iter().map(|(a,)| a));
        }
        Ok(known)
    }

    async fn get_addresses(&self, addresses: &[String]) -> Result<Vec<AddressRecord>> {
        let mut records = Vec::new();
        for chunk in addresses.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "SELECT id, address, account_id, hd_chain, hd_index \
                 FROM addresses WHERE address IN ({})",
                placeholders(chunk.len())
            );
            let rows: Vec<(i64, String, Option<i64>, Option<i64>, Option<i64>)> = self
                .retrying(|| async {
                    let mut query = sqlx::query_as(&sql);
                    for address in chunk {
                        query = query.bind(address);
                    }
                    query.fetch_all(&self.pool).await
                })
                .await?;
            for (id, address, account_id, chain, index) in rows {
                records.push(AddressRecord {
                    id,
                    address,
                    hd: membership(account_id, chain, index),
                });
            }
        }
        Ok(records)
    }

    async fn address_owners(&self, addresses: &[String]) -> Result<AddressOwners> {
        let mut owners = AddressOwners::default();
        let mut account_slots: std::collections::HashMap<i64, usize> =
            std::collections::HashMap::new();

        for chunk in addresses.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "SELECT a.id, a.address, a.account_id, a.hd_chain, a.hd_index, \
                        h.xpub, h.scheme_code, h.created \
                 FROM addresses a \
                 LEFT JOIN hd_accounts h ON h.id = a.account_id \
                 WHERE a.address IN ({})",
                placeholders(chunk.len())
            );
            type Row = (
                i64,
                String,
                Option<i64>,
                Option<i64>,
                Option<i64>,
                Option<String>,
                Option<i64>,
                Option<i64>,
            );
            let rows: Vec<Row> = self
                .retrying(|| async {
                    let mut query = sqlx::query_as(&sql);
                    for address in chunk {
                        query = query.bind(address);
                    }
                    query.fetch_all(&self.pool).await
                })
                .await?;

            for (id, address, account_id, chain, index, xpub, scheme_code, created) in rows {
                let record = AddressRecord {
                    id,
                    address,
                    hd: membership(account_id, chain, index),
                };
                match (record.hd, xpub, scheme_code) {
                    (Some(hd), Some(xpub), Some(code)) => {
                        let slot = match account_slots.get(&hd.account_id) {
                            Some(&slot) => slot,
                            None => {
                                let (scheme, locked) = DerivationScheme::from_code(code as u8)
                                    .map_err(|e| Error::Corrupt(e.to_string()))?;
                                owners.hd.push(HdAccountAddresses {
                                    account: HdAccountRecord {
                                        id: hd.account_id,
                                        xpub,
                                        scheme,
                                        locked,
                                        created: created.unwrap_or_default() as u64,
                                    },
                                    addresses: Vec::new(),
                                });
                                let slot = owners.hd.len() - 1;
                                account_slots.insert(hd.account_id, slot);
                                slot
                            }
                        };
                        owners.hd[slot].addresses.push(record);
                    }
                    _ => owners.loose.push(record),
                }
            }
        }
        Ok(owners)
    }

    async fn ensure_hd_account(&self, xpub: &str, scheme: DerivationScheme) -> Result<i64> {
        let code = scheme.to_code(false) as i64;
        let created = unix_now();
        self.retrying(|| async {
            sqlx::query(
                "INSERT INTO hd_accounts (xpub, scheme_code, created) VALUES (?, ?, ?) \
                 ON CONFLICT(xpub) DO NOTHING",
            )
            .bind(xpub)
            .bind(code)
            .bind(created)
            .execute(&self.pool)
            .await?;
            let (id,): (i64,) = sqlx::query_as("SELECT id FROM hd_accounts WHERE xpub = ?")
                .bind(xpub)
                .fetch_one(&self.pool)
                .await?;
            Ok(id)
        })
        .await
    }

    async fn hd_account_by_xpub(&self, xpub: &str) -> Result<Option<HdAccountRecord>> {
        let row: Option<(i64, String, i64, i64)> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT id, xpub, scheme_code, created FROM hd_accounts WHERE xpub = ?",
                )
                .bind(xpub)
                .fetch_optional(&self.pool)
                .await
            })
            .await?;
        row.map(|(id, xpub, code, created)| {
            let (scheme, locked) = DerivationScheme::from_code(code as u8)
                .map_err(|e| Error::Corrupt(e.to_string()))?;
            Ok(HdAccountRecord {
                id,
                xpub,
                scheme,
                locked,
                created: created as u64,
            })
        })
        .transpose()
    }

    async fn hd_next_unused_index(&self, account_id: i64, chain: Chain) -> Result<u32> {
        let (max_used,): (Option<i64>,) = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT MAX(a.hd_index) FROM addresses a \
                     JOIN outputs o ON o.address_id = a.id \
                     WHERE a.account_id = ? AND a.hd_chain = ?",
                )
                .bind(account_id)
                .bind(chain.index() as i64)
                .fetch_one(&self.pool)
                .await
            })
            .await?;
        Ok(max_used.map(|m| m as u32 + 1).unwrap_or(0))
    }

    async fn hd_max_derived_index(&self, account_id: i64, chain: Chain) -> Result<Option<u32>> {
        let (max_derived,): (Option<i64>,) = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT MAX(hd_index) FROM addresses \
                     WHERE account_id = ? AND hd_chain = ?",
                )
                .bind(account_id)
                .bind(chain.index() as i64)
                .fetch_one(&self.pool)
                .await
            })
            .await?;
        Ok(max_derived.map(|m| m as u32))
    }

    async fn hd_derived_count_in_range(
        &self,
        account_id: i64,
        chain: Chain,
        min: u32,
        max: u32,
    ) -> Result<u32> {
        let (count,): (i64,) = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM addresses \
                     WHERE account_id = ? AND hd_chain = ? AND hd_index BETWEEN ? AND ?",
                )
                .bind(account_id)
                .bind(chain.index() as i64)
                .bind(min as i64)
                .bind(max as i64)
                .fetch_one(&self.pool)
                .await
            })
            .await?;
        Ok(count as u32)
    }

    async fn insert_derived_addresses(
        &self,
        account_id: i64,
        derived: &[DerivedAddress],
    ) -> Result<()> {
        self.retrying(|| async {
            let mut tx = self.pool.begin().await?;
            for addr in derived {
                sqlx::query(
                    "INSERT INTO addresses (address, account_id, hd_chain, hd_index) \
                     VALUES (?, ?, ?, ?) ON CONFLICT(address) DO NOTHING",
                )
                .bind(&addr.address)
                .bind(account_id)
                .bind(addr.chain.index() as i64)
                .bind(addr.index as i64)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn insert_block(&self, block: &NewBlock) -> Result<i64> {
        let hash = block.hash.as_byte_array().to_vec();
        self.retrying(|| async {
            sqlx::query(
                "INSERT INTO blocks (height, hash, time, parent_id) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(hash) DO NOTHING",
            )
            .bind(block.height as i64)
            .bind(hash.as_slice())
            .bind(block.time as i64)
            .bind(block.parent_id)
            .execute(&self.pool)
            .await?;
            let (id,): (i64,) = sqlx::query_as("SELECT id FROM blocks WHERE hash = ?")
                .bind(hash.as_slice())
                .fetch_one(&self.pool)
                .await?;
            Ok(id)
        })
        .await
    }

    async fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockRecord>> {
        let blob = hash.as_byte_array().to_vec();
        let row: Option<(i64, i64, i64, Option<i64>)> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT id, height, time, parent_id FROM blocks WHERE hash = ?",
                )
                .bind(blob.as_slice())
                .fetch_optional(&self.pool)
                .await
            })
            .await?;
        Ok(row.map(|(id, height, time, parent_id)| BlockRecord {
            id,
            height: height as u32,
            hash: *hash,
            time: time as u32,
            parent_id,
        }))
    }

    async fn highest_block(&self) -> Result<Option<BlockRecord>> {
        let row: Option<(i64, i64, Vec<u8>, i64, Option<i64>)> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT id, height, hash, time, parent_id FROM blocks \
                     ORDER BY height DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await
            })
            .await?;
        row.map(|(id, height, hash, time, parent_id)| {
            Ok(BlockRecord {
                id,
                height: height as u32,
                hash: block_hash_from_blob(&hash)?,
                time: time as u32,
                parent_id,
            })
        })
        .transpose()
    }

    async fn delete_blocks_above(&self, height: u32) -> Result<u64> {
        let result = self
            .retrying(|| async {
                sqlx::query("DELETE FROM blocks WHERE height > ?")
                    .bind(height as i64)
                    .execute(&self.pool)
                    .await
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn ensure_transaction(&self, tx: &NewTransaction) -> Result<i64> {
        let txid = tx.txid.as_byte_array().to_vec();
        let created = unix_now();
        self.retrying(|| async {
            sqlx::query(
                "INSERT INTO transactions (txid, version, locktime, created) \
                 VALUES (?, ?, ?, ?) ON CONFLICT(txid) DO NOTHING",
            )
            .bind(txid.as_slice())
            .bind(tx.version as i64)
            .bind(tx.locktime as i64)
            .bind(created)
            .execute(&self.pool)
            .await?;
            let (id,): (i64,) = sqlx::query_as("SELECT id FROM transactions WHERE txid = ?")
                .bind(txid.as_slice())
                .fetch_one(&self.pool)
                .await?;
            Ok(id)
        })
        .await
    }

    async fn transaction_record(&self, txid: &Txid) -> Result<Option<TransactionRecord>> {
        let blob = txid.as_byte_array().to_vec();
        let row: Option<(i64, i64, i64, Option<i64>)> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT id, version, locktime, block_id FROM transactions WHERE txid = ?",
                )
                .bind(blob.as_slice())
                .fetch_optional(&self.pool)
                .await
            })
            .await?;
        Ok(row.map(|(id, version, locktime, block_id)| TransactionRecord {
            id,
            txid: *txid,
            version: version as i32,
            locktime: locktime as u32,
            block_id,
        }))
    }

    async fn transaction_details(&self, txid: &Txid) -> Result<Option<TransactionDetails>> {
        let blob = txid.as_byte_array().to_vec();
        let head: Option<(i64, i64, i64, Option<i64>, Option<Vec<u8>>, Option<i64>)> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT t.id, t.version, t.locktime, b.height, b.hash, b.time \
                     FROM transactions t \
                     LEFT JOIN blocks b ON b.id = t.block_id \
                     WHERE t.txid = ?",
                )
                .bind(blob.as_slice())
                .fetch_optional(&self.pool)
                .await
            })
            .await?;

        let Some((txn_id, version, locktime, height, hash, time)) = head else {
            return Ok(None);
        };

        let confirmed = match (height, hash, time) {
            (Some(height), Some(hash), Some(time)) => Some(BlockRef {
                height: height as u32,
                hash: block_hash_from_blob(&hash)?,
                time: time as u32,
            }),
            _ => None,
        };

        type OutRow = (i64, i64, String, Option<String>, Option<i64>, Option<i64>);
        let out_rows: Vec<OutRow> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT o.out_index, o.amount, a.address, h.xpub, a.hd_chain, a.hd_index \
                     FROM outputs o \
                     JOIN addresses a ON a.id = o.address_id \
                     LEFT JOIN hd_accounts h ON h.id = a.account_id \
                     WHERE o.txn_id = ? ORDER BY o.out_index",
                )
                .bind(txn_id)
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        type InRow = (
            i64,
            i64,
            Vec<u8>,
            i64,
            i64,
            String,
            Option<String>,
            Option<i64>,
            Option<i64>,
        );
        let in_rows: Vec<InRow> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT i.in_index, i.sequence, ft.txid, o.out_index, o.amount, a.address, \
                            h.xpub, a.hd_chain, a.hd_index \
                     FROM inputs i \
                     JOIN outputs o ON o.id = i.output_id \
                     JOIN transactions ft ON ft.id = o.txn_id \
                     JOIN addresses a ON a.id = o.address_id \
                     LEFT JOIN hd_accounts h ON h.id = a.account_id \
                     WHERE i.txn_id = ? ORDER BY i.in_index",
                )
                .bind(txn_id)
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        let origin = |xpub: Option<String>, chain: Option<i64>, index: Option<i64>| {
            match (xpub, chain, index) {
                (Some(xpub), Some(chain), Some(index)) => {
                    Chain::from_index(chain as u32).map(|chain| HdOrigin {
                        xpub,
                        chain,
                        index: index as u32,
                    })
                }
                _ => None,
            }
        };

        let outputs = out_rows
            .into_iter()
            .map(|(index, amount, address, xpub, chain, hd_index)| OutputDetail {
                index: index as u32,
                amount: amount as u64,
                address,
                origin: origin(xpub, chain, hd_index),
            })
            .collect();

        let inputs = in_rows
            .into_iter()
            .map(
                |(index, sequence, funding_txid, vout, amount, address, xpub, chain, hd_index)| {
                    Ok(InputDetail {
                        index: index as u32,
                        sequence: sequence as u32,
                        outpoint: OutPoint {
                            txid: txid_from_blob(&funding_txid)?,
                            vout: vout as u32,
                        },
                        amount: amount as u64,
                        address,
                        origin: origin(xpub, chain, hd_index),
                    })
                },
            )
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(TransactionDetails {
            txid: *txid,
            version: version as i32,
            locktime: locktime as u32,
            confirmed,
            inputs,
            outputs,
        }))
    }

    async fn transactions_by_ids(&self, ids: &[i64]) -> Result<Vec<TransactionRecord>> {
        let mut records = Vec::new();
        for chunk in ids.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "SELECT id, txid, version, locktime, block_id FROM transactions WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let rows: Vec<(i64, Vec<u8>, i64, i64, Option<i64>)> = self
                .retrying(|| async {
                    let mut query = sqlx::query_as(&sql);
                    for id in chunk {
                        query = query.bind(id);
                    }
                    query.fetch_all(&self.pool).await
                })
                .await?;
            for (id, txid, version, locktime, block_id) in rows {
                records.push(TransactionRecord {
                    id,
                    txid: txid_from_blob(&txid)?,
                    version: version as i32,
                    locktime: locktime as u32,
                    block_id,
                });
            }
        }
        Ok(records)
    }

    async fn confirm_transactions(&self, txids: &[Txid], block_id: i64) -> Result<()> {
        for chunk in txids.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "UPDATE transactions SET block_id = ? WHERE txid IN ({})",
                placeholders(chunk.len())
            );
            let blobs: Vec<Vec<u8>> = chunk
                .iter()
                .map(|txid| txid.as_byte_array().to_vec())
                .collect();
            self.retrying(|| async {
                let mut query = sqlx::query(&sql).bind(block_id);
                for blob in &blobs {
                    query = query.bind(blob.as_slice());
                }
                query.execute(&self.pool).await
            })
            .await?;
        }
        Ok(())
    }

    async fn unconfirm_transactions(&self, txids: &[Txid]) -> Result<()> {
        for chunk in txids.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "UPDATE transactions SET block_id = NULL WHERE txid IN ({})",
                placeholders(chunk.len())
            );
            let blobs: Vec<Vec<u8>> = chunk
                .iter()
                .map(|txid| txid.as_byte_array().to_vec())
                .collect();
            self.retrying(|| async {
                let mut query = sqlx::query(&sql);
                for blob in &blobs {
                    query = query.bind(blob.as_slice());
                }
                query.execute(&self.pool).await
            })
            .await?;
        }
        Ok(())
    }

    async fn transactions_confirmed_above(&self, height: u32) -> Result<Vec<TransactionRecord>> {
        let rows: Vec<(i64, Vec<u8>, i64, i64, Option<i64>)> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT t.id, t.txid, t.version, t.locktime, t.block_id \
                     FROM transactions t \
                     JOIN blocks b ON b.id = t.block_id \
                     WHERE b.height > ?",
                )
                .bind(height as i64)
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        rows.into_iter()
            .map(|(id, txid, version, locktime, block_id)| {
                Ok(TransactionRecord {
                    id,
                    txid: txid_from_blob(&txid)?,
                    version: version as i32,
                    locktime: locktime as u32,
                    block_id,
                })
            })
            .collect()
    }

    async fn unconfirmed_transactions(&self) -> Result<Vec<TransactionRecord>> {
        let rows: Vec<(i64, Vec<u8>, i64, i64)> = self
            .retrying(|| async {
                sqlx::query_as(
                    "SELECT id, txid, version, locktime FROM transactions WHERE block_id IS NULL",
                )
                .fetch_all(&self.pool)
                .await
            })
            .await?;
        rows.into_iter()
            .map(|(id, txid, version, locktime)| {
                Ok(TransactionRecord {
                    id,
                    txid: txid_from_blob(&txid)?,
                    version: version as i32,
                    locktime: locktime as u32,
                    block_id: None,
                })
            })
            .collect()
    }

    async fn delete_transaction(&self, txid: &Txid) -> Result<()> {
        let blob = txid.as_byte_array().to_vec();
        self.retrying(|| async {
            sqlx::query("DELETE FROM transactions WHERE txid = ?")
                .bind(blob.as_slice())
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    async fn delete_transactions_by_ids(&self, ids: &[i64]) -> Result<Vec<Txid>> {
        let mut deleted = Vec::new();
        for chunk in ids.chunks(SQL_BATCH_SIZE) {
            let select = format!(
                "SELECT txid FROM transactions WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let delete = format!(
                "DELETE FROM transactions WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let rows: Vec<(Vec<u8>,)> = self
                .retrying(|| async {
                    let mut tx = self.pool.begin().await?;
                    let mut query = sqlx::query_as(&select);
                    for id in chunk {
                        query = query.bind(id);
                    }
                    let rows: Vec<(Vec<u8>,)> = query.fetch_all(&mut *tx).await?;
                    let mut query = sqlx::query(&delete);
                    for id in chunk {
                        query = query.bind(id);
                    }
                    query.execute(&mut *tx).await?;
                    tx.commit().await?;
                    Ok(rows)
                })
                .await?;
            for (blob,) in rows {
                deleted.push(txid_from_blob(&blob)?);
            }
        }
        Ok(deleted)
    }

    async fn insert_outputs(&self, outputs: &[NewOutput]) -> Result<()> {
        self.retrying(|| async {
            let mut tx = self.pool.begin().await?;
            for output in outputs {
                sqlx::query(
                    "INSERT INTO outputs (txn_id, address_id, out_index, amount, script) \
                     VALUES (?, ?, ?, ?, ?) ON CONFLICT(txn_id, out_index) DO NOTHING",
                )
                .bind(output.txn_id)
                .bind(output.address_id)
                .bind(output.index as i64)
                .bind(output.amount as i64)
                .bind(output.script.as_slice())
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn insert_inputs(&self, inputs: &[NewInput]) -> Result<()> {
        self.retrying(|| async {
            let mut tx = self.pool.begin().await?;
            for input in inputs {
                sqlx::query(
                    "INSERT INTO inputs (txn_id, output_id, in_index, sequence) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT(txn_id, output_id) DO UPDATE SET \
                         in_index = excluded.in_index, sequence = excluded.sequence",
                )
                .bind(input.txn_id)
                .bind(input.output_id)
                .bind(input.index as i64)
                .bind(input.sequence as i64)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn output_spends(&self, outpoints: &[OutPoint]) -> Result<Vec<OutputSpend>> {
        let mut spends = Vec::new();
        for chunk in outpoints.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "SELECT o.id, ft.txid, o.out_index, a.address, o.amount, \
                        (SELECT i.txn_id FROM inputs i WHERE i.output_id = o.id LIMIT 1) \
                 FROM outputs o \
                 JOIN transactions ft ON ft.id = o.txn_id \
                 JOIN addresses a ON a.id = o.address_id \
                 WHERE (ft.txid, o.out_index) IN (VALUES {})",
                outpoint_values(chunk.len())
            );
            let blobs: Vec<(Vec<u8>, i64)> = chunk
                .iter()
                .map(|op| (op.txid.as_byte_array().to_vec(), op.vout as i64))
                .collect();
            let rows: Vec<(i64, Vec<u8>, i64, String, i64, Option<i64>)> = self
                .retrying(|| async {
                    let mut query = sqlx::query_as(&sql);
                    for (txid, vout) in &blobs {
                        query = query.bind(txid.as_slice()).bind(vout);
                    }
                    query.fetch_all(&self.pool).await
                })
                .await?;
            for (output_id, funding_txid, vout, address, amount, spending_txn_id) in rows {
                spends.push(OutputSpend {
                    output_id,
                    funding_txid: txid_from_blob(&funding_txid)?,
                    vout: vout as u32,
                    address,
                    amount: amount as u64,
                    spending_txn_id,
                });
            }
        }
        Ok(spends)
    }

    async fn known_outpoints(&self, outpoints: &[OutPoint]) -> Result<Vec<OutPoint>> {
        let mut known = Vec::new();
        for chunk in outpoints.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "SELECT ft.txid, o.out_index \
                 FROM outputs o \
                 JOIN transactions ft ON ft.id = o.txn_id \
                 WHERE (ft.txid, o.out_index) IN (VALUES {})",
                outpoint_values(chunk.len())
            );
            let blobs: Vec<(Vec<u8>, i64)> = chunk
                .iter()
                .map(|op| (op.txid.as_byte_array().to_vec(), op.vout as i64))
                .collect();
            let rows: Vec<(Vec<u8>, i64)> = self
                .retrying(|| async {
                    let mut query = sqlx::query_as(&sql);
                    for (txid, vout) in &blobs {
                        query = query.bind(txid.as_slice()).bind(vout);
                    }
                    query.fetch_all(&self.pool).await
                })
                .await?;
            for (txid, vout) in rows {
                known.push(OutPoint {
                    txid: txid_from_blob(&txid)?,
                    vout: vout as u32,
                });
            }
        }
        Ok(known)
    }

    async fn unspent_outputs(&self, addresses: &[String]) -> Result<Vec<UnspentOutput>> {
        let mut unspent = Vec::new();
        for chunk in addresses.chunks(SQL_BATCH_SIZE) {
            let sql = format!(
                "SELECT ft.txid, o.out_index, a.address, o.amount, b.height \
                 FROM outputs o \
                 JOIN transactions ft ON ft.id = o.txn_id \
                 JOIN addresses a ON a.id = o.address_id \
                 LEFT JOIN blocks b ON b.id = ft.block_id \
                 WHERE a.address IN ({}) \
                   AND NOT EXISTS (SELECT 1 FROM inputs i WHERE i.output_id = o.id)",
                placeholders(chunk.len())
            );
            let rows: Vec<(Vec<u8>, i64, String, i64, Option<i64>)> = self
                .retrying(|| async {
                    let mut query = sqlx::query_as(&sql);
                    for address in chunk {
                        query = query.bind(address);
                    }
                    query.fetch_all(&self.pool).await
                })
                .await?;
            for (txid, vout, address, amount, height) in rows {
                unspent.push(UnspentOutput {
                    txid: txid_from_blob(&txid)?,
                    vout: vout as u32,
                    address,
                    amount: amount as u64,
                    height: height.map(|h| h as u32),
                });
            }
        }
        Ok(unspent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    fn block_hash(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    async fn store() -> SqliteStore {
        SqliteStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn address_insertion_is_idempotent() {
        let store = store().await;
        let a = store.ensure_loose_address("addr1").await.unwrap();
        let b = store.ensure_loose_address("addr1").await.unwrap();
        assert_eq!(a, b);

        let known = store
            .known_addresses(&["addr1".into(), "addr2".into()])
            .await
            .unwrap();
        assert_eq!(known, vec!["addr1".to_string()]);
    }

    #[tokio::test]
    async fn block_insertion_is_idempotent_by_hash() {
        let store = store().await;
        let block = NewBlock {
            height: 100,
            hash: block_hash(1),
            time: 1_600_000_000,
            parent_id: None,
        };
        let a = store.insert_block(&block).await.unwrap();
        let b = store.insert_block(&block).await.unwrap();
        assert_eq!(a, b);

        let highest = store.highest_block().await.unwrap().unwrap();
        assert_eq!(highest.height, 100);
        assert_eq!(highest.hash, block_hash(1));
    }

    #[tokio::test]
    async fn deleting_blocks_keeps_transactions_unconfirmed() {
        let store = store().await;
        let block_id = store
            .insert_block(&NewBlock {
                height: 5,
                hash: block_hash(5),
                time: 0,
                parent_id: None,
            })
            .await
            .unwrap();
        let txn_id = store
            .ensure_transaction(&NewTransaction {
                txid: txid(9),
                version: 2,
                locktime: 0,
            })
            .await
            .unwrap();
        store
            .confirm_transactions(&[txid(9)], block_id)
            .await
            .unwrap();

        let confirmed = store.transactions_confirmed_above(4).await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].id, txn_id);

        store
            .unconfirm_transactions(&[txid(9)])
            .await
            .unwrap();
        assert_eq!(store.delete_blocks_above(4).await.unwrap(), 1);

        let record = store.transaction_record(&txid(9)).await.unwrap().unwrap();
        assert_eq!(record.block_id, None);
        let unconfirmed = store.unconfirmed_transactions().await.unwrap();
        assert_eq!(unconfirmed.len(), 1);
    }

    #[tokio::test]
    async fn output_spend_lookup_reports_spender() {
        let store = store().await;
        let addr_id = store.ensure_loose_address("addr1").await.unwrap();
        let funding = store
            .ensure_transaction(&NewTransaction {
                txid: txid(1),
                version: 1,
                locktime: 0,
            })
            .await
            .unwrap();
        store
            .insert_outputs(&[NewOutput {
                txn_id: funding,
                address_id: addr_id,
                index: 0,
                amount: 50_000,
                script: vec![0x51],
            }])
            .await
            .unwrap();

        let outpoint = OutPoint {
            txid: txid(1),
            vout: 0,
        };
        let spends = store.output_spends(&[outpoint]).await.unwrap();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].spending_txn_id, None);
        assert_eq!(spends[0].amount, 50_000);

        let spender = store
            .ensure_transaction(&NewTransaction {
                txid: txid(2),
                version: 1,
                locktime: 0,
            })
            .await
            .unwrap();
        store
            .insert_inputs(&[NewInput {
                txn_id: spender,
                output_id: spends[0].output_id,
                index: 0,
                sequence: 0xffff_ffff,
            }])
            .await
            .unwrap();

        let spends = store.output_spends(&[outpoint]).await.unwrap();
        assert_eq!(spends[0].spending_txn_id, Some(spender));

        // The spent output no longer appears as unspent.
        let unspent = store.unspent_outputs(&["addr1".into()]).await.unwrap();
        assert!(unspent.is_empty());
    }

    #[tokio::test]
    async fn reopening_the_database_keeps_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sqlite");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store
                .insert_block(&NewBlock {
                    height: 42,
                    hash: block_hash(7),
                    time: 7,
                    parent_id: None,
                })
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let highest = store.highest_block().await.unwrap().unwrap();
        assert_eq!(highest.height, 42);
        assert_eq!(highest.hash, block_hash(7));
    }

    #[tokio::test]
    async fn derived_window_queries() {
        let store = store().await;
        let account = store
            .ensure_hd_account("tpubTest", chainwatch_primitives::DerivationScheme::NativeSegwit)
            .await
            .unwrap();
        let derived: Vec<DerivedAddress> = (0..10)
            .map(|index| DerivedAddress {
                address: format!("tb1q-{index}"),
                chain: Chain::External,
                index,
            })
            .collect();
        store
            .insert_derived_addresses(account, &derived)
            .await
            .unwrap();

        assert_eq!(
            store
                .hd_max_derived_index(account, Chain::External)
                .await
                .unwrap(),
            Some(9)
        );
        assert_eq!(
            store
                .hd_max_derived_index(account, Chain::Internal)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            store
                .hd_derived_count_in_range(account, Chain::External, 3, 9)
                .await
                .unwrap(),
            7
        );
        // Nothing used yet.
        assert_eq!(
            store
                .hd_next_unused_index(account, Chain::External)
                .await
                .unwrap(),
            0
        );

        // Fund index 4 and the next unused index moves past it.
        let rows = store.get_addresses(&["tb1q-4".into()]).await.unwrap();
        let txn_id = store
            .ensure_transaction(&NewTransaction {
                txid: txid(3),
                version: 2,
                locktime: 0,
            })
            .await
            .unwrap();
        store
            .insert_outputs(&[NewOutput {
                txn_id,
                address_id: rows[0].id,
                index: 0,
                amount: 1_000,
                script: vec![],
            }])
            .await
            .unwrap();
        assert_eq!(
            store
                .hd_next_unused_index(account, Chain::External)
                .await
                .unwrap(),
            5
        );
    }
}
