//! Blockchain processor.
//!
//! Drives catch-up synchronization against the daemon and, once live,
//! turns new-block notifications into backtrace/rewind/apply sequences.

use crate::block::BlockHandler;
use crate::dedup::DedupCache;
use crate::{Result, SyncMode, TrackerConfig, TrackerEvent};
use bitcoin::BlockHash;
use chainwatch_bitcoind::{BitcoindRpc, BlockHeaderInfo, ZmqNotification};
use chainwatch_storage::StoreHandle;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Semaphore};

/// Index heights below this are treated as far behind: startup uses the
/// headers-only bulk path instead of full block matching.
const BULK_SYNC_HEIGHT_THRESHOLD: u32 = 570_000;

/// Delay before re-polling a daemon that has no headers yet.
const HEADERS_WAIT_DELAY: Duration = Duration::from_secs(30);

/// Delay before re-polling a daemon still downloading blocks.
const BLOCKS_WAIT_DELAY: Duration = Duration::from_secs(10);

/// Queue depth of the live notification guard; notifications beyond it
/// are dropped (the next backtrace covers the missed hashes).
const MAX_QUEUED_BLOCK_NOTIFICATIONS: usize = 50;

/// Admission control for the live handler: one in-flight rewind/apply
/// sequence, a bounded queue for the rest.
struct LiveGuard {
    semaphore: Semaphore,
    pending: AtomicUsize,
    capacity: usize,
}

impl LiveGuard {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(1),
            pending: AtomicUsize::new(0),
            capacity,
        }
    }

    async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if self.pending.fetch_add(1, Ordering::SeqCst) >= self.capacity {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("live guard semaphore never closes");
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(permit)
    }
}

/// Drives block ingestion: catch-up at startup, reorg-aware live handling
/// afterwards.
pub struct BlockchainProcessor {
    store: StoreHandle,
    daemon: Arc<dyn BitcoindRpc>,
    dedup: Arc<DedupCache>,
    config: TrackerConfig,
    events: broadcast::Sender<TrackerEvent>,
    mode: watch::Sender<SyncMode>,
    write_lock: Arc<Mutex<()>>,
    live_guard: LiveGuard,
}

impl BlockchainProcessor {
    pub(crate) fn new(
        store: StoreHandle,
        daemon: Arc<dyn BitcoindRpc>,
        dedup: Arc<DedupCache>,
        config: TrackerConfig,
        events: broadcast::Sender<TrackerEvent>,
        mode: watch::Sender<SyncMode>,
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
            live_guard: LiveGuard::new(MAX_QUEUED_BLOCK_NOTIFICATIONS),
        }
    }

    fn handler(&self) -> BlockHandler<'_> {
        BlockHandler::new(&*self.store, &self.dedup, &self.config)
    }

    /// Brings the index up to the daemon's tip. Daemon failures here are
    /// fatal: the error propagates and the process relies on external
    /// supervision to restart from indexed state.
    pub async fn catch_up(&self) -> Result<()> {
        let _ = self.mode.send(SyncMode::CatchingUp);

        let highest = self.store.highest_block().await?;
        let far_behind = highest
            .as_ref()
            .map(|block| block.height < BULK_SYNC_HEIGHT_THRESHOLD)
            .unwrap_or(true);

        if far_behind {
            self.catch_up_bulk().await?;
        }
        self.catch_up_steady().await
    }

    /// Headers-only bulk synchronization, iterating until the header index
    /// reaches the daemon's tip. Waits out a daemon that is itself still
    /// fetching headers or blocks.
    async fn catch_up_bulk(&self) -> Result<()> {
        tracing::info!("Tracker startup (bulk mode)");

        loop {
            let info = self.daemon.blockchain_info().await?;

            let highest = self.store.highest_block().await?;
            let db_height = highest.as_ref().map(|b| b.height).unwrap_or(0);
            let mut parent_id = highest.map(|b| b.id);

            if info.headers == 0 || info.blocks == 0 {
                tracing::info!(
                    delay = ?HEADERS_WAIT_DELAY,
                    "Daemon has no headers yet, retrying"
                );
                tokio::time::sleep(HEADERS_WAIT_DELAY).await;
                continue;
            }

            if info.headers - 1 <= db_height {
                return Ok(());
            }

            if info.blocks - 1 <= db_height {
                tracing::info!(
                    delay = ?BLOCKS_WAIT_DELAY,
                    "Waiting for daemon to fetch more blocks"
                );
                tokio::time::sleep(BLOCKS_WAIT_DELAY).await;
                continue;
            }

            let start = if db_height == 0 && parent_id.is_none() {
                0
            } else {
                db_height + 1
            };
            tracing::info!(from = start, to = info.blocks, "Sync block headers");

            for height in start..=info.blocks {
                let hash = self.daemon.block_hash(height).await?;
                let header = self.daemon.block_header(&hash).await?;
                parent_id = Some(self.handler().check_block_header(&header, parent_id).await?);
            }

            // Another round in case the daemon advanced meanwhile.
            tracing::info!("Bulk iteration finished, checking for more headers");
        }
    }

    /// Steady catch-up: full blocks, sequentially, from the indexed height
    /// to the daemon's tip. The indexed tip itself is re-processed, which
    /// is harmless (ingestion is idempotent) and heals a partial previous
    /// run.
    async fn catch_up_steady(&self) -> Result<()> {
        tracing::info!("Tracker startup (steady mode)");

        let info = self.daemon.blockchain_info().await?;

        let Some(highest) = self.store.highest_block().await? else {
            return Ok(());
        };
        if info.blocks <= highest.height {
            return Ok(());
        }

        tracing::info!(
            from = highest.height,
            to = info.blocks,
            "Sync {} blocks",
            info.blocks - highest.height + 1
        );

        for height in highest.height..=info.blocks {
            let hash = self.daemon.block_hash(height).await?;
            let header = self.daemon.block_header(&hash).await?;
            let _write = self.write_lock.lock().await;
            if let Err(err) = self.process_block(&header).await {
                // The show must go on: one failed block must not abort
                // the catch-up loop.
                tracing::error!(height, "Failed to process block: {err}");
            }
        }

        Ok(())
    }

    /// Consumes new-block notifications until the channel closes.
    pub async fn run_live(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<ZmqNotification>,
    ) {
        let _ = self.mode.send(SyncMode::Live);
        tracing::info!("Listening for blocks");

        while let Some(notification) = notifications.recv().await {
            let ZmqNotification::BlockHash(hash) = notification else {
                continue;
            };
            let processor = self.clone();
            tokio::spawn(async move {
                processor.on_block_hash(hash).await;
            });
        }
    }

    /// Handles one new-block notification: backtrace to the fork point,
    /// rewind above it, forward-apply the collected headers oldest first.
    pub async fn on_block_hash(&self, block_hash: BlockHash) {
        let Some(_permit) = self.live_guard.acquire().await else {
            tracing::warn!(%block_hash, "Notification queue full, dropping block hash");
            return;
        };

        let header = match self.daemon.block_header(&block_hash).await {
            Ok(header) => header,
            Err(err) => {
                tracing::error!(%block_hash, "Failed to fetch block header: {err}");
                return;
            }
        };
        tracing::info!(height = header.height, %block_hash, "New block");

        let mut headers = match self.chain_backtrace(header).await {
            Ok(headers) => headers,
            Err(err) => {
                tracing::error!(%block_hash, "Chain backtrace failed: {err}");
                return;
            }
        };

        // Oldest first.
        headers.reverse();
        let known_height = headers[0].height.saturating_sub(1);

        let _write = self.write_lock.lock().await;

        if let Err(err) = self.rewind(known_height).await {
            tracing::error!(known_height, "Rewind failed: {err}");
            return;
        }

        for header in &headers {
            if let Err(err) = self.process_block(header).await {
                // Later headers build on this one; stop here and let the
                // next notification backtrace over the gap.
                tracing::error!(
                    height = header.height,
                    "Failed to apply block, aborting notification: {err}"
                );
                return;
            }
        }
    }

    /// Walks `previousblockhash` pointers back from `header`, pulling
    /// headers from the daemon, until an indexed ancestor is found. The
    /// returned list is newest first.
    async fn chain_backtrace(&self, header: BlockHeaderInfo) -> Result<Vec<BlockHeaderInfo>> {
        let mut headers = vec![header];

        loop {
            let deepest = headers.last().expect("backtrace starts non-empty");
            if headers.len() > 1 {
                tracing::info!(
                    height = deepest.height,
                    blocks = headers.len(),
                    "Chain backtrace"
                );
            }

            let Some(prev_hash) = deepest.previousblockhash else {
                // Walked all the way to genesis.
                return Ok(headers);
            };

            if self.store.block_by_hash(&prev_hash).await?.is_some() {
                return Ok(headers);
            }

            let prev = self.daemon.block_header(&prev_hash).await?;
            headers.push(prev);
        }
    }

    /// Un-confirms every transaction confirmed above `height`, then drops
    /// the blocks above it.
    async fn rewind(&self, height: u32) -> Result<()> {
        let reorged = self.store.transactions_confirmed_above(height).await?;

        if !reorged.is_empty() {
            tracing::info!(
                height,
                count = reorged.len(),
                "Backtrace: unconfirming transactions in reorg"
            );
            let txids: Vec<_> = reorged.iter().map(|tx| tx.txid).collect();
            self.store.unconfirm_transactions(&txids).await?;
        }

        self.store.delete_blocks_above(height).await?;
        Ok(())
    }

    /// Re-runs the block handler over an already-seen height range.
    /// Operator recovery path.
    pub async fn rescan(&self, from_height: u32, to_height: Option<u32>) -> Result<u32> {
        let highest = self.store.highest_block().await?;
        let db_height = highest.map(|b| b.height).unwrap_or(0);

        let to_height = to_height.unwrap_or(from_height).min(db_height);
        if from_height > to_height {
            return Ok(0);
        }

        tracing::info!(
            from = from_height,
            to = to_height,
            "Blocks rescan: starting a rescan for {} blocks",
            to_height - from_height + 1
        );

        let mut processed = 0;
        for height in from_height..=to_height {
            tracing::info!(height, "Rescanning block");
            let hash = self.daemon.block_hash(height).await?;
            let header = self.daemon.block_header(&hash).await?;
            let _write = self.write_lock.lock().await;
            self.process_block(&header).await?;
            processed += 1;
        }

        Ok(processed)
    }

    #[cfg(test)]
    pub(crate) fn set_mode(&self, mode: SyncMode) {
        let _ = self.mode.send(mode);
    }

    /// Fetches and indexes one full block, then notifies downstream.
    async fn process_block(&self, header: &BlockHeaderInfo) -> Result<()> {
        let block = self.daemon.raw_block(&header.hash).await?;

        let relevant = self.handler().check_block(&block, header).await?;

        for details in relevant {
            let _ = self.events.send(TrackerEvent::Transaction(Box::new(details)));
        }
        let _ = self.events.send(TrackerEvent::Block(header.clone()));

        Ok(())
    }
}
