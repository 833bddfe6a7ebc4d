//! Stream transport: HTTP upgrade, then length-prefixed frames over TCP
//!
//! Wire format after the upgrade:
//!
//! ```text
//! +----------------+------------------------+
//! | length (u32 BE)| encrypted frame        |
//! +----------------+------------------------+
//! ```

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use super::{resolve, Transport};
use crate::config::SessionConfig;
use crate::error::TransportError;

/// Protocol token sent in the `Upgrade` header
pub const UPGRADE_PROTOCOL: &str = "vtunnel";

/// Size of the frame length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Handshake responses longer than this are rejected
const MAX_HANDSHAKE_HEADER_BYTES: usize = 8192;

/// Connection-oriented transport over an upgraded TCP stream
pub struct StreamTransport {
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    peer: SocketAddr,
    max_frame_len: usize,
}

impl StreamTransport {
    /// Connect to the server and perform the upgrade handshake
    pub async fn connect(config: &SessionConfig) -> Result<Self, TransportError> {
        let peer = resolve(config).await?;
        let host = config.server_endpoint();

        let (reader, writer) = tokio::time::timeout(
            config.connect_timeout,
            open_upgraded(peer, &host, &config.stream_path),
        )
        .await
        .map_err(|_| TransportError::ConnectFailed {
            endpoint: peer.to_string(),
            reason: format!("timed out after {:?}", config.connect_timeout),
        })??;

        tracing::info!("Stream upgraded with {} at {}", peer, config.stream_path);

        Ok(Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: watch::channel(false).0,
            peer,
            max_frame_len: config.max_frame_len,
        })
    }

    /// Server address of the underlying connection
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

async fn open_upgraded(
    peer: SocketAddr,
    host: &str,
    path: &str,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), TransportError> {
    let stream = TcpStream::connect(peer)
        .await
        .map_err(|e| TransportError::ConnectFailed {
            endpoint: peer.to_string(),
            reason: e.to_string(),
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let (read_half, mut write_half) = stream.into_split();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: {}\r\n\
         Connection: Upgrade\r\n\
         \r\n",
        path, host, UPGRADE_PROTOCOL
    );
    write_half
        .write_all(request.as_bytes())
        .await
        .map_err(|e| TransportError::HandshakeFailed {
            reason: format!("request write failed: {}", e),
        })?;

    // The reader keeps any bytes the server sent after the headers
    let mut reader = BufReader::new(read_half);
    read_upgrade_response(&mut reader).await?;
    Ok((reader, write_half))
}

/// Read the status line and headers, requiring `101 Switching Protocols`
async fn read_upgrade_response(
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<(), TransportError> {
    let mut total = 0usize;
    let mut line = String::new();

    let status = read_header_line(reader, &mut line, &mut total).await?;
    let code = status.split_whitespace().nth(1);
    if !status.starts_with("HTTP/1.") || code != Some("101") {
        return Err(TransportError::HandshakeFailed {
            reason: format!("unexpected response: {}", status),
        });
    }

    let mut upgraded = false;
    loop {
        let header = read_header_line(reader, &mut line, &mut total).await?;
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case(UPGRADE_PROTOCOL)
            {
                upgraded = true;
            }
        }
    }

    if !upgraded {
        tracing::debug!("Server accepted upgrade without echoing the protocol");
    }
    Ok(())
}

async fn read_header_line(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut String,
    total: &mut usize,
) -> Result<String, TransportError> {
    line.clear();
    let n = reader
        .read_line(line)
        .await
        .map_err(|e| TransportError::HandshakeFailed {
            reason: format!("response read failed: {}", e),
        })?;
    if n == 0 {
        return Err(TransportError::HandshakeFailed {
            reason: "connection closed during handshake".to_string(),
        });
    }
    *total += n;
    if *total > MAX_HANDSHAKE_HEADER_BYTES {
        return Err(TransportError::HandshakeFailed {
            reason: "response headers too large".to_string(),
        });
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Read one length-prefixed frame; `None` on a clean end of stream
async fn read_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    max_frame_len: usize,
) -> Result<Option<Vec<u8>>, TransportError> {
    let available = reader
        .fill_buf()
        .await
        .map_err(|e| TransportError::ReceiveFailed {
            reason: e.to_string(),
        })?;
    if available.is_empty() {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|e| stream_error(e, "length prefix"))?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_len {
        return Err(TransportError::Protocol {
            reason: format!("frame length {} exceeds limit of {}", len, max_frame_len),
        });
    }

    let mut frame = vec![0u8; len];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|e| stream_error(e, "frame body"))?;
    Ok(Some(frame))
}

fn stream_error(e: std::io::Error, what: &str) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Protocol {
            reason: format!("stream ended inside {}", what),
        }
    } else {
        TransportError::ReceiveFailed {
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_len,
            });
        }

        let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + frame.len());
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::Closed)?;
        writer
            .write_all(&buf)
            .await
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        let Some(reader) = reader.as_mut() else {
            return Ok(None);
        };

        tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|c| *c).await; } => Ok(None),
            result = read_frame(reader, self.max_frame_len) => result,
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Stream shutdown failed: {}", e);
            }
        }
        // Any pending receive has observed the flag and released the lock
        self.reader.lock().await.take();
        tracing::debug!("Closed stream transport to {}", self.peer);
    }
}
