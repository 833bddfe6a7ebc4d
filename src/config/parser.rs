//! Session file parser
//!
//! Parses `.conf` session files with [Interface] and [Server] sections.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ipnet::Ipv4Net;

use crate::crypto::CipherCodec;
use crate::error::ConfigError;

/// Default MTU of the tunnel interface
pub const DEFAULT_MTU: u16 = 1400;

/// Smallest MTU accepted for the tunnel interface (IPv4 minimum reassembly size)
pub const MIN_MTU: u16 = 576;

/// Largest MTU accepted for the tunnel interface
pub const MAX_MTU: u16 = 9000;

/// Default upper bound for a single stream frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 65535;

/// Default connect and handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifier the client reports for its own traffic
pub const DEFAULT_APPLICATION_ID: &str = "vtunnel";

/// How frames reach the remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// One encrypted frame per UDP datagram
    Datagram,
    /// Length-prefixed frames over an upgraded TCP stream
    Stream,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "datagram" | "udp" => Ok(Self::Datagram),
            "stream" | "tcp" | "ws" => Ok(Self::Stream),
            other => Err(ConfigError::UnknownTransport {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram => f.write_str("datagram"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

/// Everything needed to bring up one tunnel session
///
/// A value of this type is moved into the supervisor on connect and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Server host name or IP address
    pub server_address: String,
    /// Server port
    pub server_port: u16,
    /// Datagram or stream transport
    pub transport: TransportKind,
    /// Our address on the tunnel interface
    pub local_address: Ipv4Addr,
    /// Prefix length for `local_address`
    pub local_prefix_len: u8,
    /// DNS server pushed to the interface
    pub dns: IpAddr,
    /// Pre-shared secret the cipher key is derived from
    pub shared_key: String,
    /// Our own application identifier, always excluded from the tunnel
    pub self_application_id: String,
    /// Applications whose identifier starts with one of these bypass the tunnel
    pub bypass_prefixes: Vec<String>,
    /// Interface MTU
    pub mtu: u16,
    /// Routes sent through the tunnel
    pub routes: Vec<Ipv4Net>,
    /// Request path for the stream upgrade handshake
    pub stream_path: String,
    /// Upper bound on a stream frame length prefix
    pub max_frame_len: usize,
    /// Human readable session label handed to the platform
    pub session_name: String,
    /// Timeout for transport connect and handshake
    pub connect_timeout: Duration,
}

impl SessionConfig {
    /// Create a config with defaults for everything but the server and key
    pub fn new(
        server_address: impl Into<String>,
        server_port: u16,
        transport: TransportKind,
        shared_key: impl Into<String>,
    ) -> Self {
        Self {
            server_address: server_address.into(),
            server_port,
            transport,
            local_address: Ipv4Addr::new(10, 8, 0, 2),
            local_prefix_len: 24,
            dns: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            shared_key: shared_key.into(),
            self_application_id: DEFAULT_APPLICATION_ID.to_string(),
            bypass_prefixes: Vec::new(),
            mtu: DEFAULT_MTU,
            routes: vec![Ipv4Net::default()],
            stream_path: "/tunnel".to_string(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            session_name: DEFAULT_APPLICATION_ID.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Parse a session configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a session configuration from a string
    ///
    /// The result is validated before it is returned.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut server = ServerBuilder::default();
        let mut iface = InterfaceBuilder::default();
        let mut current_section: Option<Section> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[server]") {
                current_section = Some(Section::Server);
                continue;
            } else if line.starts_with('[') {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Unknown section: {}", line),
                });
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => match key.as_str() {
                    "address" => {
                        let net: Ipv4Net = value.parse().map_err(|_| ConfigError::InvalidCidr {
                            value: value.to_string(),
                        })?;
                        iface.address = Some(net);
                    }
                    "dns" => {
                        iface.dns = Some(value.parse().map_err(|_| ConfigError::InvalidAddress {
                            value: value.to_string(),
                        })?);
                    }
                    "mtu" => {
                        iface.mtu = Some(value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid MTU: {}", value),
                        })?);
                    }
                    "routes" => {
                        for route in value.split(',') {
                            let route = route.trim();
                            if route.is_empty() {
                                continue;
                            }
                            let net: Ipv4Net =
                                route.parse().map_err(|_| ConfigError::InvalidCidr {
                                    value: route.to_string(),
                                })?;
                            iface.routes.push(net);
                        }
                    }
                    "applicationid" => iface.application_id = Some(value.to_string()),
                    "bypassprefixes" => {
                        iface.bypass_prefixes.extend(
                            value
                                .split(',')
                                .map(str::trim)
                                .filter(|p| !p.is_empty())
                                .map(str::to_string),
                        );
                    }
                    "sessionname" => iface.session_name = Some(value.to_string()),
                    _ => {
                        tracing::debug!("Unknown interface key: {}", key);
                    }
                },
                Some(Section::Server) => match key.as_str() {
                    "address" => server.address = Some(value.to_string()),
                    "port" => server.port = Some(parse_port(value)?),
                    "transport" => server.transport = Some(value.parse()?),
                    "key" => server.key = Some(value.to_string()),
                    "path" => server.path = Some(value.to_string()),
                    "maxframesize" => {
                        server.max_frame_len =
                            Some(value.parse().map_err(|_| ConfigError::ParseError {
                                line: line_num,
                                message: format!("Invalid MaxFrameSize: {}", value),
                            })?);
                    }
                    "connecttimeout" => {
                        let secs: u64 = value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid ConnectTimeout: {}", value),
                        })?;
                        server.connect_timeout = Some(Duration::from_secs(secs));
                    }
                    _ => {
                        tracing::debug!("Unknown server key: {}", key);
                    }
                },
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        let config = Self::assemble(server, iface)?;
        config.validate()?;
        Ok(config)
    }

    fn assemble(server: ServerBuilder, iface: InterfaceBuilder) -> Result<Self, ConfigError> {
        let address = server.address.ok_or(ConfigError::MissingField {
            field: "Address in [Server]".to_string(),
        })?;
        let port = server.port.ok_or(ConfigError::MissingField {
            field: "Port in [Server]".to_string(),
        })?;
        let key = server.key.ok_or(ConfigError::MissingField {
            field: "Key in [Server]".to_string(),
        })?;

        let mut config = Self::new(
            address,
            port,
            server.transport.unwrap_or(TransportKind::Datagram),
            key,
        );

        if let Some(net) = iface.address {
            config.local_address = net.addr();
            config.local_prefix_len = net.prefix_len();
        }
        if let Some(dns) = iface.dns {
            config.dns = dns;
        }
        if let Some(mtu) = iface.mtu {
            config.mtu = mtu;
        }
        if !iface.routes.is_empty() {
            config.routes = iface.routes;
        }
        if let Some(id) = iface.application_id {
            config.self_application_id = id;
        }
        config.bypass_prefixes = iface.bypass_prefixes;
        if let Some(name) = iface.session_name {
            config.session_name = name;
        }
        if let Some(path) = server.path {
            config.stream_path = path;
        }
        if let Some(max) = server.max_frame_len {
            config.max_frame_len = max;
        }
        if let Some(timeout) = server.connect_timeout {
            config.connect_timeout = timeout;
        }

        Ok(config)
    }

    /// Reject values that would fail later, before any resource is acquired
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_address.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "server address".to_string(),
            });
        }
        if self.server_port == 0 {
            return Err(ConfigError::InvalidPort {
                value: self.server_port.to_string(),
            });
        }
        if self.shared_key.is_empty() {
            return Err(ConfigError::MissingField {
                field: "shared key".to_string(),
            });
        }
        if self.local_prefix_len > 32 {
            return Err(ConfigError::InvalidValue {
                field: "prefix length".to_string(),
                reason: format!("{} is greater than 32", self.local_prefix_len),
            });
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::InvalidValue {
                field: "MTU".to_string(),
                reason: format!("{} is outside {}..={}", self.mtu, MIN_MTU, MAX_MTU),
            });
        }
        if self.self_application_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "application id".to_string(),
            });
        }
        if self.max_frame_len < self.max_datagram_len() {
            return Err(ConfigError::InvalidValue {
                field: "MaxFrameSize".to_string(),
                reason: format!(
                    "{} cannot carry a full {}-byte packet",
                    self.max_frame_len, self.mtu
                ),
            });
        }
        if !self.stream_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "stream path".to_string(),
                reason: format!("'{}' must start with '/'", self.stream_path),
            });
        }
        Ok(())
    }

    /// Largest ciphertext a full-MTU packet turns into
    pub fn max_datagram_len(&self) -> usize {
        self.mtu as usize + CipherCodec::OVERHEAD
    }

    /// Tunnel address with prefix, e.g. `10.8.0.2/24`
    pub fn local_network(&self) -> Result<Ipv4Net, ConfigError> {
        Ipv4Net::new(self.local_address, self.local_prefix_len).map_err(|_| {
            ConfigError::InvalidCidr {
                value: format!("{}/{}", self.local_address, self.local_prefix_len),
            }
        })
    }

    /// `host:port` form of the server endpoint, bracketing IPv6 literals
    pub fn server_endpoint(&self) -> String {
        match self.server_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.server_port),
            _ => format!("{}:{}", self.server_address, self.server_port),
        }
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Server,
}

#[derive(Default)]
struct ServerBuilder {
    address: Option<String>,
    port: Option<u16>,
    transport: Option<TransportKind>,
    key: Option<String>,
    path: Option<String>,
    max_frame_len: Option<usize>,
    connect_timeout: Option<Duration>,
}

#[derive(Default)]
struct InterfaceBuilder {
    address: Option<Ipv4Net>,
    dns: Option<IpAddr>,
    mtu: Option<u16>,
    routes: Vec<Ipv4Net>,
    application_id: Option<String>,
    bypass_prefixes: Vec<String>,
    session_name: Option<String>,
}

/// Parse a port, rejecting anything outside 1..=65535
fn parse_port(value: &str) -> Result<u16, ConfigError> {
    let invalid = || ConfigError::InvalidPort {
        value: value.to_string(),
    };
    let port: u32 = value.parse().map_err(|_| invalid())?;
    match u16::try_from(port) {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(port) => Ok(port),
    }
}
