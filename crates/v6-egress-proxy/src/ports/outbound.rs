//! Outbound ports for the proxy.
//!
//! These are the interfaces the core requires from the host: something that
//! can put an address on the network interface, and something that can open
//! a TCP connection from a given source address.

use async_trait::async_trait;
use std::io;
use std::net::Ipv6Addr;
use tokio::net::TcpStream;

/// Adds and removes source addresses on the network interface.
///
/// Both operations must be idempotent: provisioning an address that is
/// already present and releasing one that is absent are not errors.
/// Implementations may block for the duration of an external command and
/// must tolerate concurrent calls for different addresses.
#[async_trait]
pub trait InterfaceBinder: Send + Sync {
    /// Make `address` present on the interface.
    async fn provision_address(&self, address: Ipv6Addr) -> Result<(), BinderError>;

    /// Remove `address` from the interface.
    async fn release_address(&self, address: Ipv6Addr) -> Result<(), BinderError>;
}

/// Errors from interface operations.
#[derive(Debug, thiserror::Error)]
pub enum BinderError {
    /// The command could not be started at all
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command ran and reported failure
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Opens outbound TCP connections bound to a local source address.
#[async_trait]
pub trait OutboundDialer: Send + Sync {
    /// Connect to `target` (`host:port`) from `source`.
    ///
    /// A single attempt; retries and timeouts are applied by the caller.
    async fn dial(&self, source: Ipv6Addr, target: &str) -> io::Result<TcpStream>;
}
