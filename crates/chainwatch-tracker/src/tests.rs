//! Engine tests against an in-memory store and a scripted daemon.

use crate::dedup::DedupCache;
use crate::transaction::TxMatcher;
use crate::{SyncMode, Tracker, TrackerConfig, TrackerEvent};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use chainwatch_bitcoind::{
    BitcoindRpc, BlockchainInfo, BlockHeaderInfo, RawTransactionInfo, RpcError,
};
use chainwatch_primitives::{derive_addresses, parse_xpub, Chain, DerivationScheme, GapLimits};
use chainwatch_storage::{MemoryStore, Store, StoreHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const XPUB: &str = "tpubDDDAe7GgFT4fzEzKwWVA4BWo8fiJXQeGEYDTexzo2w6CK1iDoLPYkpEisXo623ieF79GQ3xpcEVN1vcQhX2sysyL8o1XqzBmQb9JReTxQ7w";

#[derive(Default)]
struct MockInner {
    active: HashMap<u32, BlockHash>,
    headers: HashMap<BlockHash, BlockHeaderInfo>,
    blocks: HashMap<BlockHash, Block>,
    tip_height: u32,
    header_height: u32,
    transactions: HashMap<Txid, Option<BlockHash>>,
}

/// Scripted stand-in for the daemon RPC interface.
#[derive(Default)]
struct MockBitcoind {
    inner: Mutex<MockInner>,
}

impl MockBitcoind {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a block without putting it on the active chain.
    fn register(&self, header: BlockHeaderInfo, block: Block) {
        let mut inner = self.inner.lock();
        inner.headers.insert(header.hash, header.clone());
        inner.blocks.insert(header.hash, block);
    }

    /// Registers a block and makes it the active tip.
    fn extend_active(&self, header: BlockHeaderInfo, block: Block) {
        let height = header.height;
        let hash = header.hash;
        self.register(header, block);
        let mut inner = self.inner.lock();
        inner.active.insert(height, hash);
        inner.tip_height = inner.tip_height.max(height);
        inner.header_height = inner.header_height.max(height);
    }

    fn set_header_height(&self, height: u32) {
        self.inner.lock().header_height = height;
    }

    fn set_transaction(&self, txid: Txid, block: Option<BlockHash>) {
        self.inner.lock().transactions.insert(txid, block);
    }
}

fn not_found() -> RpcError {
    RpcError::Rpc {
        code: -5,
        message: "Not found".into(),
    }
}

#[async_trait::async_trait]
impl BitcoindRpc for MockBitcoind {
    async fn blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        let inner = self.inner.lock();
        let best = inner
            .active
            .get(&inner.tip_height)
            .copied()
            .unwrap_or_else(BlockHash::all_zeros);
        Ok(BlockchainInfo {
            chain: "test".into(),
            blocks: inner.tip_height,
            headers: inner.header_height,
            bestblockhash: best,
            initialblockdownload: false,
        })
    }

    async fn block_hash(&self, height: u32) -> Result<BlockHash, RpcError> {
        self.inner
            .lock()
            .active
            .get(&height)
            .copied()
            .ok_or_else(not_found)
    }

    async fn block_header(&self, hash: &BlockHash) -> Result<BlockHeaderInfo, RpcError> {
        self.inner
            .lock()
            .headers
            .get(hash)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn raw_block(&self, hash: &BlockHash) -> Result<Block, RpcError> {
        self.inner
            .lock()
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo, RpcError> {
        let inner = self.inner.lock();
        match inner.transactions.get(txid) {
            Some(blockhash) => Ok(RawTransactionInfo {
                txid: *txid,
                blockhash: *blockhash,
                confirmations: u32::from(blockhash.is_some()),
            }),
            None => Err(not_found()),
        }
    }
}

fn mock_hash(tag: u8, height: u32) -> BlockHash {
    let mut bytes = [0xab; 32];
    bytes[0] = tag;
    bytes[1..5].copy_from_slice(&height.to_le_bytes());
    BlockHash::from_byte_array(bytes)
}

fn mock_header(tag: u8, height: u32, prev: Option<BlockHash>) -> BlockHeaderInfo {
    BlockHeaderInfo {
        hash: mock_hash(tag, height),
        height,
        time: 1_600_000_000 + height,
        previousblockhash: prev,
        nextblockhash: None,
        confirmations: 0,
    }
}

fn mock_block(txs: Vec<Transaction>) -> Block {
    Block {
        header: bitcoin::block::Header {
            version: bitcoin::block::Version::TWO,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: bitcoin::TxMerkleNode::all_zeros(),
            time: 0,
            bits: bitcoin::CompactTarget::from_consensus(0),
            nonce: 0,
        },
        txdata: txs,
    }
}

fn pay_to(address: &str, amount: u64) -> TxOut {
    let address: bitcoin::Address = address
        .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
        .unwrap()
        .require_network(Network::Testnet)
        .unwrap();
    TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: address.script_pubkey(),
    }
}

fn spend(outpoint: OutPoint) -> TxIn {
    TxIn {
        previous_output: outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

fn make_tx(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs,
        output: outputs,
    }
}

fn test_config() -> TrackerConfig {
    TrackerConfig::new(Network::Testnet)
}

fn test_tracker() -> (Tracker, StoreHandle, Arc<MockBitcoind>) {
    let store: StoreHandle = Arc::new(MemoryStore::new());
    let daemon = MockBitcoind::new();
    let tracker = Tracker::new(store.clone(), daemon.clone(), test_config());
    (tracker, store, daemon)
}

fn external_address(index: u32) -> String {
    let xpub = parse_xpub(XPUB, Network::Testnet).unwrap();
    derive_addresses(
        &xpub,
        Chain::External,
        [index],
        DerivationScheme::NativeSegwit,
        Network::Testnet,
    )
    .unwrap()
    .remove(0)
    .address
}

async fn check_tx(store: &dyn Store, dedup: &DedupCache, tx: &Transaction) -> bool {
    let matcher = TxMatcher::new(tx, store, dedup, GapLimits::default(), Network::Testnet);
    matcher.check().await.unwrap().is_some()
}

#[tokio::test]
async fn payment_near_gap_limit_expands_the_derived_window() {
    let (tracker, store, _daemon) = test_tracker();
    let handle = tracker.handle();

    handle
        .watch_xpub(XPUB, DerivationScheme::NativeSegwit)
        .await
        .unwrap();

    let account = store.hd_account_by_xpub(XPUB).await.unwrap().unwrap();
    assert_eq!(
        store
            .hd_max_derived_index(account.id, Chain::External)
            .await
            .unwrap(),
        Some(19)
    );

    // Payment to external index 19, the edge of the initial window.
    let tx = make_tx(vec![], vec![pay_to(&external_address(19), 50_000)]);
    let dedup = DedupCache::new(100, Duration::from_secs(60));
    assert!(check_tx(&*store, &dedup, &tx).await);

    // The window now extends gap-limit past the used index.
    assert_eq!(
        store
            .hd_max_derived_index(account.id, Chain::External)
            .await
            .unwrap(),
        Some(39)
    );

    // Gap-limit invariant: max derived >= next unused - 1 + gap limit.
    let next_unused = store
        .hd_next_unused_index(account.id, Chain::External)
        .await
        .unwrap();
    assert_eq!(next_unused, 20);
    let max_derived = store
        .hd_max_derived_index(account.id, Chain::External)
        .await
        .unwrap()
        .unwrap();
    assert!(max_derived >= next_unused - 1 + 20);

    // The payment itself was recorded.
    let unspent = store
        .unspent_outputs(&[external_address(19)])
        .await
        .unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].amount, 50_000);
}

#[tokio::test]
async fn payment_beyond_window_iterates_derivation_rounds() {
    let (tracker, store, _daemon) = test_tracker();
    let handle = tracker.handle();

    handle
        .watch_xpub(XPUB, DerivationScheme::NativeSegwit)
        .await
        .unwrap();
    let account = store.hd_account_by_xpub(XPUB).await.unwrap().unwrap();

    // One transaction pays index 19 and index 35. Index 35 is outside the
    // initial window and only becomes visible after the first derivation
    // round, forcing a second round.
    let tx = make_tx(
        vec![],
        vec![
            pay_to(&external_address(19), 10_000),
            pay_to(&external_address(35), 20_000),
        ],
    );
    let dedup = DedupCache::new(100, Duration::from_secs(60));
    assert!(check_tx(&*store, &dedup, &tx).await);

    // Window extends past the *deepest* used index.
    assert_eq!(
        store
            .hd_max_derived_index(account.id, Chain::External)
            .await
            .unwrap(),
        Some(55)
    );

    // Both outputs were recorded despite index 35 being unknown when the
    // transaction entered the matcher.
    let unspent = store
        .unspent_outputs(&[external_address(19), external_address(35)])
        .await
        .unwrap();
    assert_eq!(unspent.len(), 2);
}

#[tokio::test]
async fn double_spend_evicts_the_previous_spender() {
    let (_tracker, store, _daemon) = test_tracker();
    let dedup = DedupCache::new(100, Duration::from_secs(60));

    store.ensure_loose_address("tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0").await.unwrap();

    // Funding transaction pays the tracked address.
    let funding = make_tx(
        vec![],
        vec![pay_to("tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0", 80_000)],
    );
    let funding_txid = funding.compute_txid();
    assert!(check_tx(&*store, &dedup, &funding).await);

    let outpoint = OutPoint {
        txid: funding_txid,
        vout: 0,
    };

    // First spender.
    let tx1 = make_tx(
        vec![spend(outpoint)],
        vec![pay_to("mmZ5FRccGAkwfKme4JkrsmurnimDLdfmNL", 79_000)],
    );
    let tx1_id = tx1.compute_txid();
    assert!(check_tx(&*store, &dedup, &tx1).await);
    assert!(store.transaction_record(&tx1_id).await.unwrap().is_some());

    // Conflicting spender of the same outpoint.
    let tx2 = make_tx(
        vec![spend(outpoint)],
        vec![pay_to("mmZ5FRccGAkwfKme4JkrsmurnimDLdfmNL", 78_000)],
    );
    let tx2_id = tx2.compute_txid();
    assert!(check_tx(&*store, &dedup, &tx2).await);

    // Exactly one spender survives: the most recently processed.
    assert!(store.transaction_record(&tx1_id).await.unwrap().is_none());
    let tx2_record = store.transaction_record(&tx2_id).await.unwrap().unwrap();
    let spends = store.output_spends(&[outpoint]).await.unwrap();
    assert_eq!(spends[0].spending_txn_id, Some(tx2_record.id));

    // The loser also left the dedup cache.
    assert!(!dedup.contains(&tx1_id));
    assert!(dedup.contains(&tx2_id));
}

#[tokio::test]
async fn reingesting_a_block_leaves_the_index_unchanged() {
    let (tracker, store, daemon) = test_tracker();
    let address = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(address).await.unwrap();

    let tx = make_tx(vec![], vec![pay_to(address, 10_000)]);
    let header = mock_header(0xa0, 100, None);
    daemon.extend_active(header.clone(), mock_block(vec![tx.clone()]));

    let blockchain = tracker.blockchain.clone();
    blockchain.on_block_hash(header.hash).await;
    let first_pass = store.unspent_outputs(&[address.into()]).await.unwrap();
    assert_eq!(first_pass.len(), 1);

    // Process the very same notification again.
    blockchain.on_block_hash(header.hash).await;
    let second_pass = store.unspent_outputs(&[address.into()]).await.unwrap();
    assert_eq!(first_pass, second_pass);

    let record = store
        .transaction_record(&tx.compute_txid())
        .await
        .unwrap()
        .unwrap();
    assert!(record.block_id.is_some());
}

#[tokio::test]
async fn competing_branch_rewinds_and_reapplies() {
    let (tracker, store, daemon) = test_tracker();
    let address = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(address).await.unwrap();

    // Chain A: block 100 funds the address, block 101 pays it again.
    let tx_a100 = make_tx(vec![], vec![pay_to(address, 10_000)]);
    let tx_a101 = make_tx(vec![], vec![pay_to(address, 20_000)]);
    let header_100 = mock_header(0xa0, 100, None);
    let header_a101 = mock_header(0xa1, 101, Some(header_100.hash));
    daemon.extend_active(header_100.clone(), mock_block(vec![tx_a100.clone()]));
    daemon.extend_active(header_a101.clone(), mock_block(vec![tx_a101.clone()]));

    let blockchain = tracker.blockchain.clone();
    blockchain.on_block_hash(header_100.hash).await;
    blockchain.on_block_hash(header_a101.hash).await;

    let a101_record = store
        .transaction_record(&tx_a101.compute_txid())
        .await
        .unwrap()
        .unwrap();
    assert!(a101_record.block_id.is_some());

    // Competing block B101: same parent as A101, different content.
    let tx_b101 = make_tx(vec![], vec![pay_to(address, 30_000)]);
    let header_b101 = mock_header(0xb1, 101, Some(header_100.hash));
    daemon.register(header_b101.clone(), mock_block(vec![tx_b101.clone()]));

    blockchain.on_block_hash(header_b101.hash).await;

    // A101 is gone, its transaction unconfirmed; B101 rules height 101.
    assert!(store.block_by_hash(&header_a101.hash).await.unwrap().is_none());
    let b101 = store.block_by_hash(&header_b101.hash).await.unwrap().unwrap();
    assert_eq!(b101.height, 101);

    let a101_record = store
        .transaction_record(&tx_a101.compute_txid())
        .await
        .unwrap()
        .unwrap();
    assert!(a101_record.block_id.is_none());

    let b101_record = store
        .transaction_record(&tx_b101.compute_txid())
        .await
        .unwrap()
        .unwrap();
    assert!(b101_record.block_id.is_some());

    // Block 100 survived untouched.
    let a100_record = store
        .transaction_record(&tx_a100.compute_txid())
        .await
        .unwrap()
        .unwrap();
    assert!(a100_record.block_id.is_some());
}

#[tokio::test]
async fn mempool_sighting_then_block_confirms_once() {
    let (tracker, store, daemon) = test_tracker();
    let address = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(address).await.unwrap();

    let tx = make_tx(vec![], vec![pay_to(address, 42_000)]);
    let txid = tx.compute_txid();

    // First sighting through the mempool path.
    let mempool = tracker.mempool.clone();
    mempool.on_pushed_tx(tx.clone()).await.unwrap();
    let record = store.transaction_record(&txid).await.unwrap().unwrap();
    assert!(record.block_id.is_none());

    // The same transaction arrives in a block. The prefilter skips it
    // (dedup), confirmation still lands.
    let header = mock_header(0xc0, 100, None);
    daemon.extend_active(header.clone(), mock_block(vec![tx.clone()]));
    tracker.blockchain.clone().on_block_hash(header.hash).await;

    let record = store.transaction_record(&txid).await.unwrap().unwrap();
    assert!(record.block_id.is_some());
    let details = store.transaction_details(&txid).await.unwrap().unwrap();
    assert_eq!(details.outputs.len(), 1);
}

#[tokio::test]
async fn mempool_gate_drops_transactions_while_far_behind() {
    let (tracker, store, daemon) = test_tracker();
    let address = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(address).await.unwrap();

    // Index at height 100, daemon headers at 140.
    let header = mock_header(0xd0, 100, None);
    daemon.extend_active(header.clone(), mock_block(vec![]));
    let blockchain = tracker.blockchain.clone();
    blockchain.on_block_hash(header.hash).await;
    blockchain.set_mode(SyncMode::Live);
    daemon.set_header_height(140);

    let mempool = tracker.mempool.clone();
    mempool.refresh_active_status().await.unwrap();
    assert!(!mempool.is_active());

    let tx = make_tx(vec![], vec![pay_to(address, 1_000)]);
    let mut raw = Vec::new();
    bitcoin::consensus::Encodable::consensus_encode(&tx, &mut raw).unwrap();
    mempool.on_raw_tx(&raw);
    assert_eq!(mempool.buffered(), 0);

    // Gap narrows within tolerance: ingestion resumes.
    daemon.set_header_height(103);
    mempool.refresh_active_status().await.unwrap();
    assert!(mempool.is_active());
    mempool.on_raw_tx(&raw);
    assert_eq!(mempool.buffered(), 1);
}

#[tokio::test]
async fn reconciliation_confirms_and_prunes_unconfirmed_transactions() {
    let (tracker, store, daemon) = test_tracker();
    let address = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(address).await.unwrap();

    let confirmed_tx = make_tx(vec![], vec![pay_to(address, 5_000)]);
    let vanished_tx = make_tx(vec![], vec![pay_to(address, 6_000)]);

    let mempool = tracker.mempool.clone();
    mempool.on_pushed_tx(confirmed_tx.clone()).await.unwrap();
    mempool.on_pushed_tx(vanished_tx.clone()).await.unwrap();

    // A block the index knows confirms the first transaction; the daemon
    // has forgotten the second one entirely.
    let header = mock_header(0xe0, 100, None);
    daemon.extend_active(header.clone(), mock_block(vec![]));
    tracker.blockchain.clone().on_block_hash(header.hash).await;
    daemon.set_transaction(confirmed_tx.compute_txid(), Some(header.hash));

    mempool.check_unconfirmed().await.unwrap();

    let confirmed = store
        .transaction_record(&confirmed_tx.compute_txid())
        .await
        .unwrap()
        .unwrap();
    assert!(confirmed.block_id.is_some());

    assert!(store
        .transaction_record(&vanished_tx.compute_txid())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn prefilter_has_no_false_negatives() {
    let (_tracker, store, _daemon) = test_tracker();
    let dedup = DedupCache::new(1000, Duration::from_secs(60));

    let tracked = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(tracked).await.unwrap();

    // An indexed output that later transactions may spend.
    let funding = make_tx(vec![], vec![pay_to(tracked, 70_000)]);
    let funding_txid = funding.compute_txid();
    assert!(check_tx(&*store, &dedup, &funding).await);

    // Build a mixed batch: payments to the tracked address, spends of the
    // indexed output, and unrelated noise.
    let mut bundle = crate::TransactionsBundle::new();
    let mut relevant = Vec::new();

    for salt in 0u64..40 {
        let noise_address = external_address((salt % 7) as u32);
        match salt % 4 {
            // Pays the tracked address among noise outputs.
            0 => {
                let tx = make_tx(
                    vec![],
                    vec![
                        pay_to(&noise_address, 1_000 + salt),
                        pay_to(tracked, 2_000 + salt),
                    ],
                );
                relevant.push(tx.compute_txid());
                bundle.push(tx);
            }
            // Spends the indexed output.
            1 => {
                let tx = make_tx(
                    vec![spend(OutPoint {
                        txid: funding_txid,
                        vout: 0,
                    })],
                    vec![pay_to(&noise_address, 3_000 + salt)],
                );
                relevant.push(tx.compute_txid());
                bundle.push(tx);
            }
            // Unrelated transaction.
            _ => {
                let tx = make_tx(
                    vec![spend(OutPoint {
                        txid: Txid::from_byte_array([salt as u8; 32]),
                        vout: 0,
                    })],
                    vec![pay_to(&noise_address, 4_000 + salt)],
                );
                bundle.push(tx);
            }
        }
    }

    let fresh_dedup = DedupCache::new(1000, Duration::from_secs(60));
    let filtered = bundle
        .prefilter(&*store, &fresh_dedup, Network::Testnet)
        .await
        .unwrap();
    let filtered_txids: Vec<Txid> = filtered.iter().map(|tx| tx.compute_txid()).collect();

    for txid in relevant {
        assert!(
            filtered_txids.contains(&txid),
            "prefilter dropped a relevant transaction"
        );
    }
}

#[tokio::test]
async fn steady_catch_up_pulls_blocks_to_the_daemon_tip() {
    let (tracker, store, daemon) = test_tracker();
    let address = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(address).await.unwrap();

    // Index tip is recent (above the bulk threshold), so startup picks
    // the steady path. The daemon is three blocks ahead.
    let base = 600_000;
    let header_base = mock_header(0xf0, base, None);
    daemon.extend_active(header_base.clone(), mock_block(vec![]));
    let blockchain = tracker.blockchain.clone();
    blockchain.on_block_hash(header_base.hash).await;

    let mut prev = header_base.hash;
    let mut paying_txids = Vec::new();
    for height in base + 1..=base + 3 {
        let tx = make_tx(vec![], vec![pay_to(address, height as u64)]);
        paying_txids.push(tx.compute_txid());
        let header = mock_header(0xf0, height, Some(prev));
        prev = header.hash;
        daemon.extend_active(header, mock_block(vec![tx]));
    }

    blockchain.catch_up().await.unwrap();

    let highest = store.highest_block().await.unwrap().unwrap();
    assert_eq!(highest.height, base + 3);
    for txid in paying_txids {
        let record = store.transaction_record(&txid).await.unwrap();
        assert!(record.is_some(), "catch-up missed a block transaction");
    }
}

#[tokio::test]
async fn bulk_catch_up_records_headers_without_matching() {
    let (tracker, store, daemon) = test_tracker();
    let address = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(address).await.unwrap();

    // Empty index, daemon at a low height: bulk mode, headers only.
    let mut prev = None;
    let mut txids = Vec::new();
    for height in 0..=4 {
        let tx = make_tx(vec![], vec![pay_to(address, 1_000 + height as u64)]);
        txids.push(tx.compute_txid());
        let header = mock_header(0x10, height, prev);
        prev = Some(header.hash);
        daemon.extend_active(header, mock_block(vec![tx]));
    }

    tracker.blockchain.clone().catch_up().await.unwrap();

    // Headers are indexed and parent-linked...
    let highest = store.highest_block().await.unwrap().unwrap();
    assert_eq!(highest.height, 4);
    assert!(highest.parent_id.is_some());

    // ...but no transaction matching ran on the fast path.
    for txid in txids {
        assert!(store.transaction_record(&txid).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn tracker_events_fan_out_to_subscribers() {
    let (tracker, store, daemon) = test_tracker();
    let address = "tb1qggmkgcrk5zdwm8wlh2nzqv5k7xunv3tqk6w9p0";
    store.ensure_loose_address(address).await.unwrap();

    let mut events = tracker.subscribe();

    let tx = make_tx(vec![], vec![pay_to(address, 9_000)]);
    let header = mock_header(0x90, 100, None);
    daemon.extend_active(header.clone(), mock_block(vec![tx.clone()]));
    tracker.blockchain.clone().on_block_hash(header.hash).await;

    let first = events.recv().await.unwrap();
    match first {
        TrackerEvent::Transaction(details) => {
            assert_eq!(details.txid, tx.compute_txid());
            assert_eq!(details.outputs[0].address, address);
        }
        other => panic!("Expected transaction event, got {other:?}"),
    }
    let second = events.recv().await.unwrap();
    match second {
        TrackerEvent::Block(block_header) => assert_eq!(block_header.hash, header.hash),
        other => panic!("Expected block event, got {other:?}"),
    }
}
