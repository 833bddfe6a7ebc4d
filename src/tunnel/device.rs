//! TUN device platform backed by tun-rs

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tun_rs::{AsyncDevice, DeviceBuilder};

use super::routes::RouteManager;
use super::{InterfaceRequest, PacketDevice, Platform};
use crate::error::InterfaceError;

/// Where Linux desktop entries live; their file stems serve as application ids
const DESKTOP_ENTRY_DIR: &str = "/usr/share/applications";

/// Provisions real TUN devices on the local host
pub struct TunRsPlatform {
    applications_dir: PathBuf,
}

impl Default for TunRsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl TunRsPlatform {
    /// Create a platform that enumerates applications from desktop entries
    pub fn new() -> Self {
        Self {
            applications_dir: PathBuf::from(DESKTOP_ENTRY_DIR),
        }
    }

    /// Use a different directory for application discovery
    pub fn with_applications_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            applications_dir: dir.into(),
        }
    }
}

#[async_trait]
impl Platform for TunRsPlatform {
    async fn establish(
        &self,
        request: InterfaceRequest,
    ) -> Result<Box<dyn PacketDevice>, InterfaceError> {
        check_privileges()?;

        let device = DeviceBuilder::new()
            .ipv4(request.address.addr(), request.address.prefix_len(), None)
            .mtu(request.mtu)
            .build_async()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => InterfaceError::InsufficientPrivileges {
                    message: e.to_string(),
                },
                std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::AddrInUse => {
                    InterfaceError::Denied {
                        reason: e.to_string(),
                    }
                }
                _ => InterfaceError::CreateFailed {
                    reason: e.to_string(),
                },
            })?;

        let name = device
            .deref()
            .name()
            .map_err(|e| InterfaceError::CreateFailed {
                reason: format!("Failed to get device name: {}", e),
            })?;

        tracing::info!(
            "Created TUN device {} for session '{}' with address {}",
            name,
            request.session_name,
            request.address
        );
        tracing::info!(
            "DNS {} applies to tunnelled traffic; configure the host resolver to use it",
            request.dns
        );
        if request.disallowed_applications.len() > 1 {
            tracing::warn!(
                "Per-application exclusion is not enforced by TUN devices; recorded only: {:?}",
                request.disallowed_applications
            );
        }

        let mut routes = RouteManager::new(name.clone()).await;
        for host in &request.bypass_hosts {
            if let Err(e) = routes.add_host_bypass(*host).await {
                tracing::warn!("Failed to add bypass route for {}: {}", host, e);
            }
        }
        for network in &request.routes {
            if let Err(e) = routes.add_route(*network).await {
                tracing::warn!("Failed to add route for {}: {}", network, e);
            }
        }

        Ok(Box::new(TunRsDevice {
            name,
            device: Mutex::new(Some(Arc::new(device))),
            routes: tokio::sync::Mutex::new(routes),
        }))
    }

    fn installed_applications(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.applications_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(
                    "Cannot list applications in {:?}: {}",
                    self.applications_dir,
                    e
                );
                return Vec::new();
            }
        };

        let mut apps: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "desktop"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        apps.sort();
        apps
    }
}

/// Async TUN device wrapper
struct TunRsDevice {
    /// Device name (e.g., "utun5", "tun0")
    name: String,
    /// The underlying device; `None` once closed
    device: Mutex<Option<Arc<AsyncDevice>>>,
    /// Routes to remove on close
    routes: tokio::sync::Mutex<RouteManager>,
}

impl TunRsDevice {
    fn handle(&self) -> Option<Arc<AsyncDevice>> {
        self.device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl PacketDevice for TunRsDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.handle() {
            Some(device) => device.recv(buf).await,
            None => Ok(0),
        }
    }

    async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        match self.handle() {
            Some(device) => device.send(packet).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "device closed",
            )),
        }
    }

    async fn close(&self) {
        self.routes.lock().await.cleanup().await;
        let device = self
            .device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(device);
        tracing::debug!("Closed TUN device {}", self.name);
    }
}

/// Check for required privileges to create TUN devices
fn check_privileges() -> Result<(), InterfaceError> {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // CAP_NET_ADMIN may still be granted; let device creation decide
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./vtunnel");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(InterfaceError::InsufficientPrivileges {
                    message: "Root privileges required on macOS. Run with sudo.".to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installed_applications_from_desktop_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("org.mozilla.firefox.desktop"), "").unwrap();
        std::fs::write(dir.path().join("com.bank.mobile.desktop"), "").unwrap();
        std::fs::write(dir.path().join("README"), "").unwrap();

        let platform = TunRsPlatform::with_applications_dir(dir.path());
        assert_eq!(
            platform.installed_applications(),
            vec!["com.bank.mobile", "org.mozilla.firefox"]
        );
    }

    #[test]
    fn test_missing_applications_dir() {
        let platform = TunRsPlatform::with_applications_dir("/nonexistent/applications");
        assert!(platform.installed_applications().is_empty());
    }
}
