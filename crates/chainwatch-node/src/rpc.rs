//! Operator RPC interface.

use chainwatch_primitives::{implied_scheme, DerivationScheme};
use chainwatch_tracker::{TrackerHandle, TrackerStatus};
use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::{ErrorObject, ErrorObjectOwned};
use std::net::SocketAddr;

const BASE_ERROR: i32 = 20000;

fn into_rpc_error(err: impl std::fmt::Display) -> ErrorObjectOwned {
    ErrorObject::owned(BASE_ERROR + 1, err.to_string(), None::<()>)
}

/// Tracker operator API.
#[rpc(server)]
pub trait TrackerApi {
    /// Current tracker state: sync mode, heights, buffer size.
    #[method(name = "tracker_status")]
    async fn status(&self) -> Result<TrackerStatus, ErrorObjectOwned>;

    /// Re-runs the block handler over an already-seen height range.
    /// Returns the number of blocks processed.
    #[method(name = "tracker_rescan")]
    async fn rescan(
        &self,
        from_height: u32,
        to_height: Option<u32>,
    ) -> Result<u32, ErrorObjectOwned>;

    /// Declares a loose address as tracked.
    #[method(name = "tracker_watchAddress")]
    async fn watch_address(&self, address: String) -> Result<(), ErrorObjectOwned>;

    /// Declares an extended public key as tracked. Without an explicit
    /// scheme, the encoding prefix decides.
    #[method(name = "tracker_watchXpub")]
    async fn watch_xpub(
        &self,
        xpub: String,
        scheme: Option<DerivationScheme>,
    ) -> Result<(), ErrorObjectOwned>;
}

/// This struct serves the tracker operator API.
pub struct TrackerRpc {
    handle: TrackerHandle,
}

#[async_trait]
impl TrackerApiServer for TrackerRpc {
    async fn status(&self) -> Result<TrackerStatus, ErrorObjectOwned> {
        self.handle.status().await.map_err(into_rpc_error)
    }

    async fn rescan(
        &self,
        from_height: u32,
        to_height: Option<u32>,
    ) -> Result<u32, ErrorObjectOwned> {
        self.handle
            .rescan(from_height, to_height)
            .await
            .map_err(into_rpc_error)
    }

    async fn watch_address(&self, address: String) -> Result<(), ErrorObjectOwned> {
        self.handle
            .watch_address(&address)
            .await
            .map_err(into_rpc_error)
    }

    async fn watch_xpub(
        &self,
        xpub: String,
        scheme: Option<DerivationScheme>,
    ) -> Result<(), ErrorObjectOwned> {
        let scheme = match scheme {
            Some(scheme) => scheme,
            None => implied_scheme(&xpub).map_err(into_rpc_error)?,
        };
        self.handle
            .watch_xpub(&xpub, scheme)
            .await
            .map_err(into_rpc_error)
    }
}

/// Starts the operator RPC server on the given address.
pub async fn start(
    handle: TrackerHandle,
    listen: SocketAddr,
) -> Result<ServerHandle, crate::Error> {
    let server = Server::builder().build(listen).await?;
    let rpc = TrackerRpc { handle };
    Ok(server.start(rpc.into_rpc()))
}
