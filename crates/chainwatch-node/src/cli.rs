//! Command line interface.

use crate::{events, rpc};
use chainwatch_bitcoind::{BitcoindClient, BitcoindConfig, BitcoindRpc, ZmqTopic};
use chainwatch_primitives::implied_scheme;
use chainwatch_storage::{SqliteStore, StoreHandle};
use chainwatch_tracker::{Tracker, TrackerConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Delay between attempts to reach the daemon at startup.
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the tracker.
    Run(Run),
}

/// The `run` command.
#[derive(Debug, Clone, Parser)]
pub struct Run {
    /// Bitcoin network (bitcoin, testnet, signet, regtest).
    #[clap(long, default_value = "bitcoin")]
    pub network: bitcoin::Network,

    /// URL of the daemon's JSON-RPC endpoint.
    #[clap(long, default_value = "http://127.0.0.1:8332")]
    pub bitcoind_rpc_url: String,

    /// RPC user name.
    #[clap(long)]
    pub bitcoind_rpc_user: Option<String>,

    /// RPC password.
    #[clap(long)]
    pub bitcoind_rpc_password: Option<String>,

    /// ZeroMQ endpoint publishing `hashblock` notifications.
    #[clap(long, default_value = "tcp://127.0.0.1:28332")]
    pub zmq_block_endpoint: String,

    /// ZeroMQ endpoint publishing `rawtx` notifications.
    #[clap(long, default_value = "tcp://127.0.0.1:28333")]
    pub zmq_tx_endpoint: String,

    /// Path of the index database.
    #[clap(long, default_value = "chainwatch.sqlite")]
    pub db_path: PathBuf,

    /// Listen address of the operator RPC server.
    #[clap(long, default_value = "127.0.0.1:8340")]
    pub rpc_listen: SocketAddr,

    /// ZeroMQ endpoint the tracker binds to publish block/transaction
    /// events.
    #[clap(long, default_value = "tcp://127.0.0.1:28350")]
    pub events_endpoint: String,

    /// Gap limit applied to both chains of tracked HD accounts.
    #[clap(long, default_value = "20")]
    pub gap_limit: u32,

    /// Loose address to track. May be repeated.
    #[clap(long = "watch-address")]
    pub watch_addresses: Vec<String>,

    /// Extended public key to track; the encoding prefix selects the
    /// derivation scheme. May be repeated.
    #[clap(long = "watch-xpub")]
    pub watch_xpubs: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "chainwatch", about = "Wallet-backend blockchain tracker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Parse and run command line arguments.
pub fn run() -> Result<(), crate::Error> {
    let Cli { command } = Cli::parse();

    match command {
        Command::Run(run) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_node(run))
        }
    }
}

async fn run_node(run: Run) -> Result<(), crate::Error> {
    let mut tracker_config = TrackerConfig::new(run.network);
    tracker_config.gap_limits.external = run.gap_limit;
    tracker_config.gap_limits.internal = run.gap_limit;

    let store: StoreHandle = Arc::new(SqliteStore::open(&run.db_path).await?);

    let daemon = Arc::new(BitcoindClient::new(BitcoindConfig {
        rpc_url: run.bitcoind_rpc_url.clone(),
        rpc_user: run.bitcoind_rpc_user.clone(),
        rpc_password: run.bitcoind_rpc_password.clone(),
    }));

    let info = daemon.wait_until_ready(STARTUP_RETRY_DELAY).await;
    tracing::info!(
        chain = %info.chain,
        blocks = info.blocks,
        headers = info.headers,
        "Connected to daemon"
    );

    let daemon: Arc<dyn BitcoindRpc> = daemon;
    let tracker = Tracker::new(store, daemon, tracker_config);
    let handle = tracker.handle();

    for address in &run.watch_addresses {
        handle.watch_address(address).await?;
        tracing::info!(address, "Tracking address");
    }
    for xpub in &run.watch_xpubs {
        let scheme = implied_scheme(xpub)?;
        handle.watch_xpub(xpub, scheme).await?;
        tracing::info!(%scheme, "Tracking HD account");
    }

    let rpc_server = rpc::start(handle.clone(), run.rpc_listen).await?;
    tracing::info!(listen = %run.rpc_listen, "Operator RPC server started");

    events::spawn_publisher(run.events_endpoint.clone(), handle.subscribe());

    let block_hashes =
        chainwatch_bitcoind::subscribe(run.zmq_block_endpoint.clone(), ZmqTopic::HashBlock);
    let raw_txs = chainwatch_bitcoind::subscribe(run.zmq_tx_endpoint.clone(), ZmqTopic::RawTx);

    tokio::select! {
        result = tracker.run(block_hashes, raw_txs) => {
            // Catch-up failures are fatal; supervision restarts us from
            // the indexed state.
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    rpc_server.stop().ok();
    Ok(())
}
