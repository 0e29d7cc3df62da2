//! Channel transport
//!
//! This module provides the socket layer under the device channel:
//! - `Transport` opens a WebSocket to the derived socket URL
//! - `ChannelConnection` owns one socket, joins and heartbeats
//! - `ConnectionSupervisor` retries with backoff, then indefinitely

pub mod connection;
pub mod heartbeat;
pub mod mock;
pub mod supervisor;
pub mod url;

pub use connection::{ChannelConnection, ChannelSignal, ConnectionState};
pub use heartbeat::Heartbeat;
pub use mock::{MockBehavior, MockTransport};
pub use supervisor::{ChannelStatus, ConnectOutcome, ConnectionSupervisor, RetryConfig, SupervisorState};
pub use url::{socket_url, SOCKET_PATH};

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ConnectError;

/// Channel timing and endpoint settings
///
/// # Defaults
/// - 10s socket open timeout
/// - 5s join reply timeout
/// - 30s heartbeat interval
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub open_timeout: Duration,
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub socket_path: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            socket_path: SOCKET_PATH.to_string(),
        }
    }
}

/// Lock ignoring poison: state behind these mutexes stays consistent between statements
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens the raw WebSocket under a channel connection
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a socket to `url`; the caller applies the open timeout
    async fn open(&self, url: &str) -> Result<WebSocketStream<Self::Io>, ConnectError>;
}

/// WebSocket transport over TCP (TLS for `wss`)
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    type Io = MaybeTlsStream<TcpStream>;

    async fn open(&self, url: &str) -> Result<WebSocketStream<Self::Io>, ConnectError> {
        let (stream, response) = connect_async(url).await?;
        tracing::debug!("WebSocket upgrade completed with status {}", response.status());
        Ok(stream)
    }
}
