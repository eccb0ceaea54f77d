//! # chainwatch tracker engine
//!
//! Maintains a continuously-updated index of the transaction graph around
//! a set of tracked addresses and HD accounts, following a Bitcoin daemon
//! through catch-up, live blocks, reorgs and the mempool.
//!
//! Two independently triggered processors share one store handle:
//!
//! - [`chain::BlockchainProcessor`] ingests blocks: bulk/steady catch-up
//!   at startup, then backtrace/rewind/apply on each new-block
//!   notification.
//! - [`mempool::MempoolProcessor`] buffers unconfirmed transactions
//!   between periodic flushes and reconciles the indexed unconfirmed set
//!   against the daemon.
//!
//! The blockchain processor publishes its [`SyncMode`] on a watch
//! channel, and both processors serialize index mutation through a shared
//! writer lock, so the two loops never interleave writes.

mod block;
mod bundle;
mod chain;
mod config;
mod dedup;
mod mempool;
#[cfg(test)]
mod tests;
mod transaction;

pub use bundle::TransactionsBundle;
pub use chain::BlockchainProcessor;
pub use config::TrackerConfig;
pub use dedup::DedupCache;
pub use mempool::MempoolProcessor;

use bitcoin::Transaction;
use chainwatch_bitcoind::{BitcoindRpc, BlockHeaderInfo, RpcError, ZmqNotification};
use chainwatch_primitives::{derive_addresses, parse_xpub, Chain, DerivationScheme, HdError};
use chainwatch_storage::StoreHandle;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

/// Tracker error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] chainwatch_storage::Error),

    #[error(transparent)]
    Daemon(#[from] RpcError),

    #[error(transparent)]
    Hd(#[from] HdError),

    #[error(transparent)]
    BlockDecode(#[from] bitcoin::consensus::encode::Error),

    #[error("Index inconsistency: {0}")]
    Inconsistent(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outbound notification published to downstream consumers.
///
/// Delivery is at-most-once with no redelivery; consumers needing a
/// stronger guarantee must reconcile through queries or a rescan.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    /// A block was indexed.
    Block(BlockHeaderInfo),
    /// A relevant transaction was indexed (seen in the mempool or a
    /// block).
    Transaction(Box<chainwatch_storage::TransactionDetails>),
}

/// Synchronization mode published by the blockchain processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    CatchingUp,
    Live,
}

/// Point-in-time snapshot of the tracker, for the operator interface.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    pub mode: SyncMode,
    pub indexed_height: Option<u32>,
    pub daemon_blocks: u32,
    pub daemon_headers: u32,
    pub mempool_buffered: usize,
}

/// Composition root: owns the outbound notification channel and the two
/// processors.
pub struct Tracker {
    blockchain: Arc<BlockchainProcessor>,
    mempool: Arc<MempoolProcessor>,
    events: broadcast::Sender<TrackerEvent>,
    mode: watch::Receiver<SyncMode>,
    pushed_tx: mpsc::UnboundedSender<Transaction>,
    pushed_rx: mpsc::UnboundedReceiver<Transaction>,
    store: StoreHandle,
    daemon: Arc<dyn BitcoindRpc>,
    config: TrackerConfig,
}

impl Tracker {
    pub fn new(store: StoreHandle, daemon: Arc<dyn BitcoindRpc>, config: TrackerConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (mode_tx, mode) = watch::channel(SyncMode::CatchingUp);
        let (pushed_tx, pushed_rx) = mpsc::unbounded_channel();
        let write_lock = Arc::new(Mutex::new(()));
        let dedup = Arc::new(DedupCache::new(config.dedup_capacity, config.dedup_ttl));

        let blockchain = Arc::new(BlockchainProcessor::new(
            store.clone(),
            daemon.clone(),
            dedup.clone(),
            config.clone(),
            events.clone(),
            mode_tx,
            write_lock.clone(),
        ));

        let mempool = Arc::new(MempoolProcessor::new(
            store.clone(),
            daemon.clone(),
            dedup,
            config.clone(),
            events.clone(),
            mode.clone(),
            write_lock,
        ));

        Self {
            blockchain,
            mempool,
            events,
            mode,
            pushed_tx,
            pushed_rx,
            store,
            daemon,
            config,
        }
    }

    /// Subscribes to outbound notifications. At-most-once delivery: a slow
    /// consumer loses messages rather than applying backpressure.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Returns a cloneable handle for the operator interface.
    pub fn handle(&self) -> TrackerHandle {
        TrackerHandle {
            blockchain: self.blockchain.clone(),
            mempool: self.mempool.clone(),
            events: self.events.clone(),
            mode: self.mode.clone(),
            pushed_tx: self.pushed_tx.clone(),
            store: self.store.clone(),
            daemon: self.daemon.clone(),
            config: self.config.clone(),
        }
    }

    /// Runs the tracker: catch-up first, then the live block loop and the
    /// mempool loops side by side.
    ///
    /// Returns only when the notification channels close or catch-up hits
    /// a fatal daemon failure.
    pub async fn run(
        self,
        block_hashes: mpsc::UnboundedReceiver<ZmqNotification>,
        raw_txs: mpsc::UnboundedReceiver<ZmqNotification>,
    ) -> Result<()> {
        self.blockchain.catch_up().await?;

        let blockchain = self.blockchain.clone().run_live(block_hashes);
        let mempool = self.mempool.clone().run(raw_txs, self.pushed_rx);

        tokio::join!(blockchain, mempool);
        Ok(())
    }
}

/// Cloneable handle exposing the operator surface of a running tracker.
#[derive(Clone)]
pub struct TrackerHandle {
    blockchain: Arc<BlockchainProcessor>,
    mempool: Arc<MempoolProcessor>,
    events: broadcast::Sender<TrackerEvent>,
    mode: watch::Receiver<SyncMode>,
    pushed_tx: mpsc::UnboundedSender<Transaction>,
    store: StoreHandle,
    daemon: Arc<dyn BitcoindRpc>,
    config: TrackerConfig,
}

impl TrackerHandle {
    /// Subscribes to outbound notifications (at-most-once, see
    /// [`Tracker::subscribe`]).
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Re-runs the block handler over a height range. Used to recover
    /// from index corruption or historical gaps.
    pub async fn rescan(&self, from_height: u32, to_height: Option<u32>) -> Result<u32> {
        self.blockchain.rescan(from_height, to_height).await
    }

    /// Hands a freshly broadcast transaction to the mempool processor.
    pub fn push_transaction(&self, tx: Transaction) {
        let _ = self.pushed_tx.send(tx);
    }

    /// Declares a loose address as tracked.
    pub async fn watch_address(&self, address: &str) -> Result<()> {
        let parsed: bitcoin::Address<bitcoin::address::NetworkUnchecked> = address
            .parse()
            .map_err(|_| Error::Inconsistent(format!("invalid address {address}")))?;
        let address = parsed
            .require_network(self.config.network)
            .map_err(|_| Error::Inconsistent(format!("address {address} is for another network")))?
            .to_string();
        self.store.ensure_loose_address(&address).await?;
        Ok(())
    }

    /// Declares an HD account as tracked and seeds its derived window up
    /// to the gap limit on both chains.
    pub async fn watch_xpub(&self, xpub: &str, scheme: DerivationScheme) -> Result<()> {
        let parsed = parse_xpub(xpub, self.config.network)?;
        let normalized = parsed.to_string();
        let account_id = self.store.ensure_hd_account(&normalized, scheme).await?;

        for chain in Chain::ALL {
            let gap_limit = self.config.gap_limits.for_chain(chain);
            let from = self
                .store
                .hd_max_derived_index(account_id, chain)
                .await?
                .map(|max| max + 1)
                .unwrap_or(0);
            if from >= gap_limit {
                continue;
            }
            let derived = derive_addresses(
                &parsed,
                chain,
                from..gap_limit,
                scheme,
                self.config.network,
            )?;
            self.store
                .insert_derived_addresses(account_id, &derived)
                .await?;
        }

        Ok(())
    }

    /// Snapshot of the tracker state.
    pub async fn status(&self) -> Result<TrackerStatus> {
        let info = self.daemon.blockchain_info().await?;
        let highest = self.store.highest_block().await?;
        Ok(TrackerStatus {
            mode: *self.mode.borrow(),
            indexed_height: highest.map(|b| b.height),
            daemon_blocks: info.blocks,
            daemon_headers: info.headers,
            mempool_buffered: self.mempool.buffered(),
        })
    }
}
