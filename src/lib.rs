//! vtunnel - VPN tunnel client
//!
//! Captures IP packets on a local TUN interface, encrypts them and forwards
//! them to a remote endpoint over a selectable transport, then writes the
//! decrypted replies back to the interface.
//!
//! # Features
//!
//! - Datagram (UDP) and stream (HTTP upgrade + length-prefixed TCP) transports
//! - ChaCha20-Poly1305 frame encryption keyed from a shared secret
//! - Split tunneling by application identifier prefix
//! - Serialized connect/disconnect with full rollback on failure
//! - Daemon mode with a token-protected REST API
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use vtunnel::{NetworkConnector, SessionConfig, SessionSupervisor, TunRsPlatform};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::from_file("session.conf")?;
//!     let supervisor = SessionSupervisor::new(
//!         Arc::new(TunRsPlatform::new()),
//!         Arc::new(NetworkConnector),
//!     );
//!     supervisor.connect(config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod daemon;
pub mod error;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{SessionConfig, TransportKind};
pub use crypto::CipherCodec;
pub use daemon::DaemonService;
pub use error::VtunnelError;
pub use session::{ForwardingSession, SessionState, StopReason};
pub use supervisor::{SessionEvent, SessionSupervisor};
pub use transport::{Connector, NetworkConnector, Transport};
pub use tunnel::{Platform, TunInterface, TunRsPlatform};
