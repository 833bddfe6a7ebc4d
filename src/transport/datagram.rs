//! UDP transport: one encrypted frame per datagram

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::{resolve, Transport};
use crate::config::SessionConfig;
use crate::error::TransportError;

/// Requested kernel buffer size; the OS may clamp it
const SOCKET_BUFFER_SIZE: usize = 1 << 20;

/// Connectionless transport bound to a single server endpoint
pub struct DatagramTransport {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    closed: watch::Sender<bool>,
    peer: SocketAddr,
    max_frame_len: usize,
}

impl DatagramTransport {
    /// Resolve the server and bind a local socket connected to it
    pub async fn connect(config: &SessionConfig) -> Result<Self, TransportError> {
        let peer = resolve(config).await?;
        let socket = bind_connected(peer).map_err(|e| TransportError::ConnectFailed {
            endpoint: peer.to_string(),
            reason: e.to_string(),
        })?;

        if let Ok(local) = socket.local_addr() {
            tracing::info!("UDP socket {} connected to {}", local, peer);
        }

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            closed: watch::channel(false).0,
            peer,
            max_frame_len: config.max_datagram_len(),
        })
    }

    /// Server address frames are sent to
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn handle(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Create a non-blocking UDP socket on an ephemeral port, connected to `peer`
fn bind_connected(peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = Domain::for_address(peer);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::debug!("Failed to enlarge receive buffer: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::debug!("Failed to enlarge send buffer: {}", e);
    }

    let local = match peer.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    socket.bind(&SockAddr::from(local))?;
    socket.connect(&SockAddr::from(peer))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Wait for the next usable datagram, skipping empty and oversized ones
async fn recv_frame(
    socket: &UdpSocket,
    peer: SocketAddr,
    max_frame_len: usize,
) -> Result<Vec<u8>, TransportError> {
    // One spare byte detects datagrams that were truncated to fit
    let mut buf = vec![0u8; max_frame_len + 1];

    loop {
        match socket.recv(&mut buf).await {
            Ok(0) => {
                tracing::trace!("Dropping empty datagram from {}", peer);
            }
            Ok(n) if n > max_frame_len => {
                tracing::debug!("Dropping oversized datagram from {}", peer);
            }
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            // ICMP port unreachable surfaces here until the server is up
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::debug!("Server {} refused datagram", peer);
            }
            Err(e) => {
                return Err(TransportError::ReceiveFailed {
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_len,
            });
        }
        let socket = self.handle().ok_or(TransportError::Closed)?;
        socket
            .send(frame)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }
        let Some(socket) = self.handle() else {
            return Ok(None);
        };

        tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|c| *c).await; } => Ok(None),
            result = recv_frame(&socket, self.peer, self.max_frame_len) => result.map(Some),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if socket.is_some() {
            tracing::debug!("Closed UDP transport to {}", self.peer);
        }
    }
}
