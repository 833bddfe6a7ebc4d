//! Route management for directing traffic through the tunnel
//!
//! Routes are installed with the platform's own tooling (`ip` on Linux,
//! `route` on macOS) and removed again when the device is closed.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tokio::process::Command;

use crate::error::InterfaceError;

/// Tracks routes added for one interface so they can be undone
pub struct RouteManager {
    /// Device name for routing
    device_name: String,
    /// Routes that have been added
    added_routes: Vec<Ipv4Net>,
    /// Host routes pinned to the default gateway
    host_bypasses: Vec<Ipv4Addr>,
    /// Gateway captured when the manager was created
    default_gateway: Option<Ipv4Addr>,
}

impl RouteManager {
    /// Create a route manager for `device_name`
    pub async fn new(device_name: String) -> Self {
        let default_gateway = query_default_gateway().await;
        if default_gateway.is_none() {
            tracing::debug!("No default gateway found; host bypass routes unavailable");
        }

        Self {
            device_name,
            added_routes: Vec::new(),
            host_bypasses: Vec::new(),
            default_gateway,
        }
    }

    /// Route `network` through the tunnel
    ///
    /// A default route is installed as two /1 halves so it takes precedence
    /// over the existing default without replacing it.
    pub async fn add_route(&mut self, network: Ipv4Net) -> Result<(), InterfaceError> {
        for net in split_default_route(network) {
            let args = route_args(RouteOp::Add, &self.device_name, &net).ok_or_else(|| {
                InterfaceError::RouteSetupFailed {
                    network: net.to_string(),
                    reason: format!("unsupported platform: {}", std::env::consts::OS),
                }
            })?;
            run(&args)
                .await
                .map_err(|reason| InterfaceError::RouteSetupFailed {
                    network: net.to_string(),
                    reason,
                })?;
            self.added_routes.push(net);
            tracing::info!("Added route: {} via {}", net, self.device_name);
        }
        Ok(())
    }

    /// Keep `host` reachable over the physical network
    pub async fn add_host_bypass(&mut self, host: Ipv4Addr) -> Result<(), InterfaceError> {
        let gateway = self.default_gateway.ok_or_else(|| InterfaceError::RouteSetupFailed {
            network: format!("{}/32", host),
            reason: "default gateway unknown".to_string(),
        })?;
        let args = bypass_args(RouteOp::Add, host, gateway).ok_or_else(|| {
            InterfaceError::RouteSetupFailed {
                network: format!("{}/32", host),
                reason: format!("unsupported platform: {}", std::env::consts::OS),
            }
        })?;
        run(&args)
            .await
            .map_err(|reason| InterfaceError::RouteSetupFailed {
                network: format!("{}/32", host),
                reason,
            })?;
        self.host_bypasses.push(host);
        tracing::info!("Added bypass route for {} via {}", host, gateway);
        Ok(())
    }

    /// Remove everything this manager added; best effort
    pub async fn cleanup(&mut self) {
        if let Some(gateway) = self.default_gateway {
            for host in self.host_bypasses.drain(..) {
                if let Some(args) = bypass_args(RouteOp::Delete, host, gateway) {
                    if let Err(e) = run(&args).await {
                        tracing::warn!("Failed to remove bypass route for {}: {}", host, e);
                    }
                }
            }
        }

        for network in self.added_routes.drain(..) {
            match route_args(RouteOp::Delete, &self.device_name, &network) {
                Some(args) => match run(&args).await {
                    Ok(()) => tracing::debug!("Removed route: {}", network),
                    // The kernel drops device routes with the device itself
                    Err(e) => tracing::debug!("Route {} already gone: {}", network, e),
                },
                None => tracing::warn!("Cannot remove route {} on this platform", network),
            }
        }
    }

    /// Routes currently installed
    pub fn routes(&self) -> &[Ipv4Net] {
        &self.added_routes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteOp {
    Add,
    Delete,
}

/// Expand 0.0.0.0/0 into 0.0.0.0/1 + 128.0.0.0/1
fn split_default_route(network: Ipv4Net) -> Vec<Ipv4Net> {
    if network.prefix_len() != 0 {
        return vec![network];
    }
    match network.subnets(1) {
        Ok(halves) => halves.collect(),
        Err(_) => vec![network],
    }
}

fn verb(op: RouteOp) -> &'static str {
    match (op, cfg!(target_os = "linux")) {
        (RouteOp::Add, _) => "add",
        (RouteOp::Delete, true) => "del",
        (RouteOp::Delete, false) => "delete",
    }
}

#[cfg(target_os = "linux")]
fn route_args(op: RouteOp, device: &str, network: &Ipv4Net) -> Option<Vec<String>> {
    Some(
        ["ip", "route", verb(op), &network.to_string(), "dev", device]
            .map(String::from)
            .to_vec(),
    )
}

#[cfg(target_os = "macos")]
fn route_args(op: RouteOp, device: &str, network: &Ipv4Net) -> Option<Vec<String>> {
    Some(
        ["route", "-n", verb(op), "-net", &network.to_string(), "-interface", device]
            .map(String::from)
            .to_vec(),
    )
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn route_args(_op: RouteOp, _device: &str, _network: &Ipv4Net) -> Option<Vec<String>> {
    None
}

#[cfg(target_os = "linux")]
fn bypass_args(op: RouteOp, host: Ipv4Addr, gateway: Ipv4Addr) -> Option<Vec<String>> {
    Some(
        ["ip", "route", verb(op), &format!("{}/32", host), "via", &gateway.to_string()]
            .map(String::from)
            .to_vec(),
    )
}

#[cfg(target_os = "macos")]
fn bypass_args(op: RouteOp, host: Ipv4Addr, gateway: Ipv4Addr) -> Option<Vec<String>> {
    Some(
        ["route", "-n", verb(op), "-host", &host.to_string(), &gateway.to_string()]
            .map(String::from)
            .to_vec(),
    )
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn bypass_args(_op: RouteOp, _host: Ipv4Addr, _gateway: Ipv4Addr) -> Option<Vec<String>> {
    None
}

/// Run a route command, returning a readable reason on failure
async fn run(args: &[String]) -> Result<(), String> {
    let (program, rest) = args.split_first().ok_or_else(|| "empty command".to_string())?;
    let output = Command::new(program)
        .args(rest)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Get the current IPv4 default gateway
#[cfg(target_os = "linux")]
async fn query_default_gateway() -> Option<Ipv4Addr> {
    let output = Command::new("ip")
        .args(["-4", "route", "show", "default"])
        .output()
        .await
        .ok()?;
    parse_ip_route_gateway(&String::from_utf8_lossy(&output.stdout))
}

/// Get the current IPv4 default gateway
#[cfg(target_os = "macos")]
async fn query_default_gateway() -> Option<Ipv4Addr> {
    let output = Command::new("route")
        .args(["-n", "get", "default"])
        .output()
        .await
        .ok()?;
    parse_route_get_gateway(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn query_default_gateway() -> Option<Ipv4Addr> {
    None
}

/// Extract the gateway from `ip route show default` output
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ip_route_gateway(output: &str) -> Option<Ipv4Addr> {
    output
        .split_whitespace()
        .skip_while(|&s| s != "via")
        .nth(1)
        .and_then(|s| s.parse().ok())
}

/// Extract the gateway from `route -n get default` output
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_route_get_gateway(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with("gateway:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|s| s.trim().parse().ok())
}
