//! Frame transports to the remote endpoint
//!
//! The forwarding loops only see the [`Transport`] contract. Two
//! implementations exist:
//! - [`DatagramTransport`]: one frame per UDP datagram, best effort
//! - [`StreamTransport`]: length-prefixed frames over an upgraded TCP stream

pub mod datagram;
pub mod stream;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::config::{SessionConfig, TransportKind};
use crate::error::TransportError;

pub use datagram::DatagramTransport;
pub use stream::StreamTransport;

/// Moves encrypted frames to and from the remote endpoint
///
/// All methods take `&self` so one task can block in `receive` while another
/// sends. After `close`, `receive` reports end of stream and `send` fails with
/// [`TransportError::Closed`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame; `Ok(None)` means the remote side ended the stream
    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Release the underlying socket; later calls are no-ops
    async fn close(&self);
}

/// Creates connected transports for a session
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connects real sockets according to [`SessionConfig::transport`]
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkConnector;

#[async_trait]
impl Connector for NetworkConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn Transport>, TransportError> {
        tracing::info!(
            "Connecting {} transport to {}",
            config.transport,
            config.server_endpoint()
        );
        match config.transport {
            TransportKind::Datagram => Ok(Box::new(DatagramTransport::connect(config).await?)),
            TransportKind::Stream => Ok(Box::new(StreamTransport::connect(config).await?)),
        }
    }
}

/// Resolve the configured server to a socket address, preferring IPv4
pub async fn resolve(config: &SessionConfig) -> Result<SocketAddr, TransportError> {
    let endpoint = config.server_endpoint();
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&endpoint)
        .await
        .map_err(|_| TransportError::ResolveFailed {
            host: config.server_address.clone(),
        })?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::ResolveFailed {
            host: config.server_address.clone(),
        })
}
