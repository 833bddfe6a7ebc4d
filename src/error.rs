//! Error types for the vtunnel client

use thiserror::Error;

/// Main error type for vtunnel
#[derive(Error, Debug)]
pub enum VtunnelError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Virtual interface errors
    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid port: {value}")]
    InvalidPort { value: String },

    #[error("Unknown transport kind: {value}")]
    UnknownTransport { value: String },

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Virtual interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Platform denied the interface request: {reason}")]
    Denied { reason: String },

    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Route setup failed for {network}: {reason}")]
    RouteSetupFailed { network: String, reason: String },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },
}

/// Transport errors, covering both datagram and stream variants
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("DNS resolution failed for {host}")]
    ResolveFailed { host: String },

    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Frame too large: {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Transport is closed")]
    Closed,
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Shared key must not be empty")]
    InvalidKey,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Ciphertext truncated: {len} bytes is shorter than the frame overhead")]
    Truncated { len: usize },
}

impl VtunnelError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Interface(InterfaceError::InsufficientPrivileges { .. }) => {
                #[cfg(target_os = "linux")]
                return "Insufficient privileges. Run with sudo or grant CAP_NET_ADMIN:\n  \
                        sudo setcap cap_net_admin=eip ./vtunnel"
                    .to_string();
                #[cfg(target_os = "macos")]
                return "Insufficient privileges. Run with sudo:\n  \
                        sudo ./vtunnel -c session.conf"
                    .to_string();
                #[cfg(not(any(target_os = "linux", target_os = "macos")))]
                return format!("{}", self);
            }

            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Interface(InterfaceError::Denied { reason }) => {
                format!(
                    "The platform refused to create the tunnel interface: {}\n  \
                    Another VPN may already own the device.",
                    reason
                )
            }

            Self::Transport(TransportError::ConnectFailed { endpoint, .. }) => {
                format!(
                    "Could not reach {}.\n  \
                    Check that the tunnel server is running and accessible.",
                    endpoint
                )
            }

            Self::Transport(TransportError::HandshakeFailed { reason }) => {
                format!(
                    "Server rejected the upgrade handshake: {}\n  \
                    Check the server port and the stream path.",
                    reason
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Fatal errors
            Self::Config(_) => false,
            Self::Interface(_) => false,
            Self::Crypto(CryptoError::InvalidKey) => false,
            Self::Transport(TransportError::FrameTooLarge { .. }) => false,

            // Recoverable errors
            Self::Transport(_) => true,
            Self::Crypto(_) => true,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Interface(InterfaceError::InsufficientPrivileges { .. }) => 2,
            Self::Transport(_) => 3,
            Self::Crypto(_) => 5,
            Self::Interface(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for vtunnel operations
pub type Result<T> = std::result::Result<T, VtunnelError>;
