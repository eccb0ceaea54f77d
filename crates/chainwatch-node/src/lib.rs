//! chainwatch node library.
//!
//! Wires the tracker engine to a real daemon, the SQLite store, the
//! operator RPC server and the ZeroMQ event publisher, and runs it all as
//! a CLI application.

mod cli;
mod events;
mod rpc;

pub use self::cli::run;

/// Node error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Tracker(#[from] chainwatch_tracker::Error),

    #[error(transparent)]
    Storage(#[from] chainwatch_storage::Error),

    #[error(transparent)]
    Hd(#[from] chainwatch_primitives::HdError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Initializes the tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_logger() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
