//! Block handler.
//!
//! Runs the prefilter and matcher over a decoded block, records the block
//! itself, and confirms its transactions. Confirmation is unconditional
//! for every transaction the index knows: a transaction irrelevant today
//! may become relevant through a later block, so the bookkeeping cannot
//! depend on the relevance decision.

use crate::bundle::TransactionsBundle;
use crate::dedup::DedupCache;
use crate::transaction::TxMatcher;
use crate::{Result, TrackerConfig};
use bitcoin::Block;
use chainwatch_bitcoind::BlockHeaderInfo;
use chainwatch_storage::{NewBlock, Store, TransactionDetails};

pub(crate) struct BlockHandler<'a> {
    store: &'a dyn Store,
    dedup: &'a DedupCache,
    config: &'a TrackerConfig,
}

impl<'a> BlockHandler<'a> {
    pub(crate) fn new(
        store: &'a dyn Store,
        dedup: &'a DedupCache,
        config: &'a TrackerConfig,
    ) -> Self {
        Self {
            store,
            dedup,
            config,
        }
    }

    /// Indexes one full block, returning the relevant transactions for
    /// notification.
    pub(crate) async fn check_block(
        &self,
        block: &Block,
        header: &BlockHeaderInfo,
    ) -> Result<Vec<TransactionDetails>> {
        let started = std::time::Instant::now();
        let mut notify = Vec::new();

        let bundle = TransactionsBundle::from_transactions(block.txdata.clone());
        let filtered = bundle
            .prefilter(self.store, self.dedup, self.config.network)
            .await?;

        for tx in &filtered {
            let matcher = TxMatcher::new(
                tx,
                self.store,
                self.dedup,
                self.config.gap_limits,
                self.config.network,
            );
            match matcher.check().await {
                Ok(Some(check)) => notify.push(check.details),
                Ok(None) => {}
                // One bad transaction must not abort the whole block.
                Err(err) => {
                    tracing::error!(
                        txid = %tx.compute_txid(),
                        height = header.height,
                        "Failed to process transaction: {err}"
                    );
                }
            }
        }

        let parent = match header.previousblockhash {
            Some(prev) => self.store.block_by_hash(&prev).await?,
            None => None,
        };

        let block_id = self
            .store
            .insert_block(&NewBlock {
                height: header.height,
                hash: header.hash,
                time: header.time,
                parent_id: parent.map(|b| b.id),
            })
            .await?;

        let txids: Vec<_> = block.txdata.iter().map(|tx| tx.compute_txid()).collect();
        self.store.confirm_transactions(&txids, block_id).await?;

        tracing::info!(
            height = header.height,
            txs = txids.len(),
            relevant = notify.len(),
            elapsed = ?started.elapsed(),
            "Indexed block"
        );

        Ok(notify)
    }

    /// Records only the block header. Bulk catch-up path: no transaction
    /// matching, no confirmation changes.
    pub(crate) async fn check_block_header(
        &self,
        header: &BlockHeaderInfo,
        parent_id: Option<i64>,
    ) -> Result<i64> {
        let block_id = self
            .store
            .insert_block(&NewBlock {
                height: header.height,
                hash: header.hash,
                time: header.time,
                parent_id,
            })
            .await?;

        tracing::debug!(height = header.height, "Indexed block header");

        Ok(block_id)
    }
}
