//! Outbound dialer that binds each connection to a chosen IPv6 source.

use crate::ports::OutboundDialer;
use async_trait::async_trait;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::trace;

/// Resolves the target and connects from `[source]:0`.
///
/// Only IPv6 candidates are tried. Binding to `::` leaves the choice of
/// local address to the kernel.
#[derive(Debug, Clone, Default)]
pub struct BoundTcpDialer;

impl BoundTcpDialer {
    pub fn new() -> Self {
        Self
    }

    async fn connect_from(source: Ipv6Addr, remote: SocketAddr) -> io::Result<TcpStream> {
        let socket = TcpSocket::new_v6()?;
        socket.bind(SocketAddr::V6(SocketAddrV6::new(source, 0, 0, 0)))?;
        socket.connect(remote).await
    }
}

#[async_trait]
impl OutboundDialer for BoundTcpDialer {
    async fn dial(&self, source: Ipv6Addr, target: &str) -> io::Result<TcpStream> {
        let candidates: Vec<SocketAddr> = lookup_host(target)
            .await?
            .filter(SocketAddr::is_ipv6)
            .collect();

        if candidates.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{target} has no IPv6 address"),
            ));
        }

        let mut last_error = None;
        for remote in candidates {
            match Self::connect_from(source, remote).await {
                Ok(stream) => {
                    trace!(source = %source, remote = %remote, "Connected");
                    return Ok(stream);
                }
                Err(e) => {
                    trace!(source = %source, remote = %remote, error = %e, "Candidate failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| io::Error::other("no candidates")))
    }
}
