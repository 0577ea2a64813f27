//! RPC server for client communication.
//!
//! Provides a JSON-RPC 2.0 interface over TCP for starting and cancelling
//! jobs, querying status and history, and triggering DR sweeps.
//!
//! ## Architecture
//!
//! - `protocol`: JSON-RPC 2.0 request/response types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: Method dispatcher and handlers
//! - `client`: Client for connecting to the daemon

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError};

/// RPC server that exposes daemon functionality to clients.
pub struct RpcServer {
    transport: Transport,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Create a new RPC server bound to the given address.
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let handler = MethodHandler::new(ctx);
        Self {
            transport: Transport::new(bind_addr, handler),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the RPC server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transport.listen(self.shutdown.clone()).await
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
