//! Virtual interface abstraction
//!
//! The platform hands out a packet device; [`TunInterface`] owns it for the
//! lifetime of one session and guarantees it is closed exactly once.
//! [`device::TunRsPlatform`] provides devices through the tun-rs crate on
//! macOS (utun), Linux (/dev/net/tun) and Windows (Wintun).

pub mod device;
pub mod routes;
pub mod split;

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::config::SessionConfig;
use crate::error::InterfaceError;

pub use device::TunRsPlatform;

/// Everything the platform needs to provision one interface
///
/// Built fresh for every connect and moved into [`Platform::establish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    /// Label shown by the platform for this tunnel
    pub session_name: String,
    /// Local tunnel address with prefix
    pub address: Ipv4Net,
    /// DNS server for tunnelled traffic
    pub dns: IpAddr,
    /// Interface MTU
    pub mtu: u16,
    /// Applications whose traffic must bypass the tunnel
    pub disallowed_applications: BTreeSet<String>,
    /// Networks routed into the tunnel
    pub routes: Vec<Ipv4Net>,
    /// Hosts that must keep using the underlying network (the tunnel server)
    pub bypass_hosts: Vec<Ipv4Addr>,
}

/// A bidirectional packet handle returned by the platform
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Interface name (e.g. "utun5", "tun0")
    fn name(&self) -> &str;

    /// Read one IP packet; `Ok(0)` means the device has been closed
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write one IP packet
    async fn send(&self, packet: &[u8]) -> std::io::Result<usize>;

    /// Close the handle and undo any platform state tied to it
    async fn close(&self);
}

/// Host platform that provisions virtual interfaces
#[async_trait]
pub trait Platform: Send + Sync {
    /// Create an interface, or fail if the platform denies VPN ownership
    async fn establish(
        &self,
        request: InterfaceRequest,
    ) -> Result<Box<dyn PacketDevice>, InterfaceError>;

    /// Identifiers of installed applications, for split tunneling
    fn installed_applications(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Attributes of an acquired interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub mtu: u16,
    pub address: Ipv4Net,
    pub dns: IpAddr,
    pub disallowed_applications: BTreeSet<String>,
}

/// Owned virtual interface for one session
pub struct TunInterface {
    device: Box<dyn PacketDevice>,
    info: InterfaceInfo,
    released: AtomicBool,
}

impl TunInterface {
    /// Request an interface from the platform for this session
    ///
    /// An unusable tunnel address is a configuration error and never reaches
    /// the platform.
    pub async fn acquire(
        platform: &dyn Platform,
        config: &SessionConfig,
    ) -> crate::error::Result<Self> {
        let address = config.local_network()?;

        let installed = platform.installed_applications();
        let disallowed = split::disallowed_applications(
            &config.self_application_id,
            &installed,
            &config.bypass_prefixes,
        );

        // A literal IPv4 server address is pinned to the physical network so
        // encrypted frames never loop back into the tunnel
        let bypass_hosts = config
            .server_address
            .parse::<Ipv4Addr>()
            .map(|ip| vec![ip])
            .unwrap_or_default();

        let request = InterfaceRequest {
            session_name: config.session_name.clone(),
            address,
            dns: config.dns,
            mtu: config.mtu,
            disallowed_applications: disallowed.clone(),
            routes: config.routes.clone(),
            bypass_hosts,
        };

        let device = platform.establish(request).await?;
        let info = InterfaceInfo {
            name: device.name().to_string(),
            mtu: config.mtu,
            address,
            dns: config.dns,
            disallowed_applications: disallowed,
        };

        tracing::info!(
            "Acquired interface {} with address {} ({} application(s) excluded)",
            info.name,
            info.address,
            info.disallowed_applications.len()
        );

        Ok(Self {
            device,
            info,
            released: AtomicBool::new(false),
        })
    }

    /// Interface attributes
    pub fn info(&self) -> &InterfaceInfo {
        &self.info
    }

    /// Read one packet into `buf`
    ///
    /// Returns `Ok(None)` once the interface has been closed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, InterfaceError> {
        if self.is_released() {
            return Ok(None);
        }
        match self.device.recv(buf).await {
            Ok(0) => Ok(None),
            Ok(len) => Ok(Some(len)),
            Err(e) => Err(InterfaceError::ReadFailed {
                reason: e.to_string(),
            }),
        }
    }

    /// Write one packet; losses here are tolerated by callers
    pub async fn write(&self, packet: &[u8]) -> Result<(), InterfaceError> {
        if self.is_released() {
            return Err(InterfaceError::WriteFailed {
                reason: "interface released".to_string(),
            });
        }
        self.device
            .send(packet)
            .await
            .map(|_| ())
            .map_err(|e| InterfaceError::WriteFailed {
                reason: e.to_string(),
            })
    }

    /// Close the handle; later calls are no-ops
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.device.close().await;
        tracing::info!("Released interface {}", self.info.name);
    }

    /// Whether [`release`](Self::release) has run
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for TunInterface {
    fn drop(&mut self) {
        if !self.is_released() {
            tracing::warn!(
                "Interface {} dropped without release; platform routes may remain",
                self.info.name
            );
        }
    }
}
