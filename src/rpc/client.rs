//! RPC client for connecting to the daemon.
//!
//! One request per connection, matching the daemon's line framing.

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC client for communicating with the daemon.
pub struct RpcClient {
    addr: SocketAddr,
    timeout: Duration,
}

/// Error returned by RPC client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    Connect(#[source] std::io::Error),
    #[error("Communication error: {0}")]
    Io(#[source] std::io::Error),
    #[error("Daemon did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

impl RpcClient {
    /// Create a new client that will connect to the given address.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Call an RPC method and return the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        tokio::time::timeout(self.timeout, self.round_trip(method, params))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    /// Call an RPC method with no parameters.
    pub async fn call_no_params<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, ClientError> {
        self.call(method, None).await
    }

    async fn round_trip<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;

        let request = Request::call(method, params, 1);

        let mut request_json = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        request_json.push('\n');

        stream
            .write_all(request_json.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .await
            .map_err(ClientError::Io)?;

        let response: Response =
            serde_json::from_str(&response_line).map_err(ClientError::Parse)?;

        let result = response.into_result().map_err(ClientError::Rpc)?;
        serde_json::from_value(result).map_err(ClientError::Parse)
    }
}
