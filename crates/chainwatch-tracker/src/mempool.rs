//! Mempool processor.
//!
//! Buffers raw transactions between periodic flushes, reconciles indexed
//! unconfirmed transactions against the daemon's current view, and gates
//! its own ingestion on how far the index lags behind the daemon.

use crate::bundle::TransactionsBundle;
use crate::dedup::DedupCache;
use crate::transaction::TxMatcher;
use crate::{Result, SyncMode, TrackerConfig, TrackerEvent};
use bitcoin::consensus::Decodable;
use bitcoin::Transaction;
use chainwatch_bitcoind::{BitcoindRpc, ZmqNotification};
use chainwatch_storage::StoreHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;

/// Buffers and reconciles unconfirmed transactions.
pub struct MempoolProcessor {
    store: StoreHandle,
    daemon: Arc<dyn BitcoindRpc>,
    dedup: Arc<DedupCache>,
    config: TrackerConfig,
    events: broadcast::Sender<TrackerEvent>,
    mode: watch::Receiver<SyncMode>,
    write_lock: Arc<Mutex<()>>,
    buffer: parking_lot::Mutex<TransactionsBundle>,
    /// Ingestion switch: false while the index is too far behind the
    /// daemon for mempool relevance to mean anything.
    active: AtomicBool,
}

impl MempoolProcessor {
    pub(crate) fn new(
        store: StoreHandle,
        daemon: Arc<dyn BitcoindRpc>,
        dedup: Arc<DedupCache>,
        config: TrackerConfig,
        events: broadcast::Sender<TrackerEvent>,
        mode: watch::Receiver<SyncMode>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            daemon,
            dedup,
            config,
            events,
            mode,
            write_lock,
            buffer: parking_lot::Mutex::new(TransactionsBundle::new()),
            active: AtomicBool::new(false),
        }
    }

    /// Number of transactions waiting in the accumulation buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Runs the two periodic loops and the ingestion channels until both
    /// notification channels close.
    pub async fn run(
        self: Arc<Self>,
        mut raw_txs: mpsc::UnboundedReceiver<ZmqNotification>,
        mut pushed: mpsc::UnboundedReceiver<Transaction>,
    ) {
        if let Err(err) = self.check_unconfirmed().await {
            tracing::error!("Failed to reconcile unconfirmed transactions: {err}");
        }

        let mut flush = tokio::time::interval(self.config.mempool_flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = tokio::time::interval(self.config.unconfirmed_check_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Listening for mempool transactions");

        loop {
            tokio::select! {
                _ = flush.tick() => {
                    if let Err(err) = self.process_mempool().await {
                        tracing::error!("Mempool flush failed: {err}");
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(err) = self.check_unconfirmed().await {
                        tracing::error!("Failed to reconcile unconfirmed transactions: {err}");
                    }
                }
                maybe = raw_txs.recv() => {
                    let Some(notification) = maybe else { break };
                    if let ZmqNotification::RawTransaction(bytes) = notification {
                        self.on_raw_tx(&bytes);
                    }
                }
                maybe = pushed.recv() => {
                    let Some(tx) = maybe else { break };
                    if let Err(err) = self.on_pushed_tx(tx).await {
                        tracing::error!("Failed to process pushed transaction: {err}");
                    }
                }
            }
        }
    }

    /// Buffers one raw mempool transaction. Dropped, not buffered, while
    /// the processor is inactive.
    pub fn on_raw_tx(&self, bytes: &[u8]) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        match Transaction::consensus_decode(&mut &bytes[..]) {
            Ok(tx) => self.buffer.lock().push(tx),
            Err(err) => {
                tracing::error!("Failed to decode mempool transaction: {err}");
            }
        }
    }

    /// Processes a transaction pushed from inside the system (freshly
    /// broadcast), outside the flush cadence.
    pub async fn on_pushed_tx(&self, tx: Transaction) -> Result<()> {
        let txid = tx.compute_txid();
        tracing::info!(%txid, "Processing pushed transaction");

        if self.dedup.contains(&txid) {
            return Ok(());
        }

        let _write = self.write_lock.lock().await;
        let matcher = TxMatcher::new(
            &tx,
            &*self.store,
            &self.dedup,
            self.config.gap_limits,
            self.config.network,
        );
        if let Some(check) = matcher.check().await? {
            let _ = self
                .events
                .send(TrackerEvent::Transaction(Box::new(check.details)));
        }
        Ok(())
    }

    /// Swaps the buffer out and runs it through the prefilter and matcher
    /// like a block's transaction list, minus confirmation.
    pub async fn process_mempool(&self) -> Result<()> {
        self.refresh_active_status().await?;

        let current = self.buffer.lock().take();
        let label = if self.active.load(Ordering::Relaxed) {
            "active"
        } else {
            "inactive"
        };
        tracing::info!(
            buffered = current.len(),
            "Processing {label} mempool buffer"
        );

        if current.is_empty() {
            return Ok(());
        }

        let _write = self.write_lock.lock().await;

        let filtered = current
            .prefilter(&*self.store, &self.dedup, self.config.network)
            .await?;

        for tx in &filtered {
            let matcher = TxMatcher::new(
                tx,
                &*self.store,
                &self.dedup,
                self.config.gap_limits,
                self.config.network,
            );
            match matcher.check().await {
                Ok(Some(check)) => {
                    let _ = self
                        .events
                        .send(TrackerEvent::Transaction(Box::new(check.details)));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        txid = %tx.compute_txid(),
                        "Failed to process mempool transaction: {err}"
                    );
                }
            }
        }

        Ok(())
    }

    /// Asks the daemon about every indexed unconfirmed transaction:
    /// confirms those now buried in known blocks, deletes those the
    /// daemon no longer knows (replaced or evicted upstream).
    pub async fn check_unconfirmed(&self) -> Result<()> {
        let started = std::time::Instant::now();
        tracing::info!("Processing unconfirmed transactions");

        let _write = self.write_lock.lock().await;
        let unconfirmed = self.store.unconfirmed_transactions().await?;

        for tx in &unconfirmed {
            match self.daemon.raw_transaction(&tx.txid).await {
                Ok(info) => {
                    let Some(block_hash) = info.blockhash else {
                        continue;
                    };
                    if let Some(block) = self.store.block_by_hash(&block_hash).await? {
                        tracing::info!(txid = %tx.txid, "Marking transaction confirmed");
                        self.store
                            .confirm_transactions(&[tx.txid], block.id)
                            .await?;
                    }
                }
                Err(err) if err.is_not_found() => {
                    // Replaced or evicted upstream.
                    self.dedup.remove(&tx.txid);
                    self.store.delete_transaction(&tx.txid).await?;
                    tracing::info!(txid = %tx.txid, "Dropped orphaned transaction");
                }
                Err(err) => {
                    tracing::error!(txid = %tx.txid, "Failed to query transaction: {err}");
                }
            }
        }

        let elapsed = started.elapsed();
        let per_tx = if unconfirmed.is_empty() {
            Duration::ZERO
        } else {
            elapsed / unconfirmed.len() as u32
        };
        tracing::info!(
            txs = unconfirmed.len(),
            elapsed = ?elapsed,
            per_tx = ?per_tx,
            "Finished processing unconfirmed transactions"
        );

        Ok(())
    }

    /// Refreshes the ingestion switch: live mode and within a few blocks
    /// of the daemon's header height.
    pub async fn refresh_active_status(&self) -> Result<()> {
        if *self.mode.borrow() != SyncMode::Live {
            self.active.store(false, Ordering::Relaxed);
            return Ok(());
        }

        let info = self.daemon.blockchain_info().await?;

        let active = match self.store.highest_block().await? {
            Some(highest) if highest.height > 0 => {
                info.headers <= highest.height + self.config.activity_gap_tolerance
            }
            _ => false,
        };
        self.active.store(active, Ordering::Relaxed);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}
