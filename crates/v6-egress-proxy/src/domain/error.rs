//! Error types for the proxy.
//!
//! Tunnel errors map onto HTTP status codes the same way for every request:
//! client mistakes are 4xx and never touch the ledger, allocation and dial
//! failures are 5xx.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use std::net::Ipv6Addr;

/// Errors raised by the address ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Release for an address the ledger does not know.
    #[error("address {0} is not in the ledger")]
    NotFound(Ipv6Addr),

    /// Release for an address whose active tunnel count is already zero.
    #[error("address {0} has no active tunnels to release")]
    NoActiveTunnels(Ipv6Addr),

    /// The interface refused to provision the address.
    #[error("failed to provision {address} on interface: {reason}")]
    Provision { address: Ipv6Addr, reason: String },
}

/// Coarse classification of tunnel failures, used for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelErrorKind {
    ClientRequest,
    Allocation,
    Dial,
    Relay,
}

impl std::fmt::Display for TunnelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelErrorKind::ClientRequest => write!(f, "client_request"),
            TunnelErrorKind::Allocation => write!(f, "allocation"),
            TunnelErrorKind::Dial => write!(f, "dial"),
            TunnelErrorKind::Relay => write!(f, "relay"),
        }
    }
}

/// Errors that end a single tunnel attempt.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Anything but CONNECT.
    #[error("HTTP requests are not supported, got {0}")]
    UnsupportedMethod(String),

    /// The source address override header is not an IPv6 literal.
    #[error("invalid source address {value:?}: {reason}")]
    InvalidSourceAddress { value: String, reason: String },

    /// The CONNECT target is not in `host:port` form.
    #[error("invalid CONNECT target {0:?}")]
    InvalidTarget(String),

    /// The ledger could not allocate the source address.
    #[error("source address allocation failed: {0}")]
    Allocation(#[from] LedgerError),

    /// Every bounded dial attempt failed.
    #[error("dial {target} from {source_addr} failed after {attempts} attempts: {last_error}")]
    Dial {
        target: String,
        source_addr: Ipv6Addr,
        attempts: u32,
        #[source]
        last_error: io::Error,
    },

    /// I/O failure while relaying an established tunnel.
    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),

    /// The client connection could not be taken over after the 200.
    #[error("connection upgrade failed: {0}")]
    Upgrade(String),
}

impl TunnelError {
    pub fn kind(&self) -> TunnelErrorKind {
        match self {
            TunnelError::UnsupportedMethod(_)
            | TunnelError::InvalidSourceAddress { .. }
            | TunnelError::InvalidTarget(_) => TunnelErrorKind::ClientRequest,
            TunnelError::Allocation(_) => TunnelErrorKind::Allocation,
            TunnelError::Dial { .. } => TunnelErrorKind::Dial,
            TunnelError::Relay(_) | TunnelError::Upgrade(_) => TunnelErrorKind::Relay,
        }
    }

    /// HTTP status returned to the client for this failure.
    ///
    /// Relay and upgrade failures happen after the 200 has been written, so
    /// their status is only used in logs.
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            TunnelErrorKind::ClientRequest => StatusCode::BAD_REQUEST,
            TunnelErrorKind::Allocation => StatusCode::INTERNAL_SERVER_ERROR,
            TunnelErrorKind::Dial => StatusCode::BAD_GATEWAY,
            TunnelErrorKind::Relay => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        (self.status_code(), format!("{}\n", self)).into_response()
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Service-level errors (startup and listener failures).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to initialize logging: {0}")]
    Logging(String),
}
