//! Bidirectional byte relay for an established tunnel.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Which side ended the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Target,
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub closed_by: ClosedBy,
    pub client_to_target: u64,
    pub target_to_client: u64,
    /// Set when the finishing direction failed instead of reaching EOF
    pub error: Option<io::Error>,
}

/// Copy both directions until either one finishes, then shut down both
/// write sides and drop both streams.
pub async fn relay<C, T>(client: C, target: T) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);
    let mut client_to_target = 0u64;
    let mut target_to_client = 0u64;

    let (closed_by, result) = tokio::select! {
        result = pump(&mut client_read, &mut target_write, &mut client_to_target) => {
            (ClosedBy::Client, result)
        }
        result = pump(&mut target_read, &mut client_write, &mut target_to_client) => {
            (ClosedBy::Target, result)
        }
    };

    if let Err(e) = target_write.shutdown().await {
        debug!(error = %e, "Target shutdown failed");
    }
    if let Err(e) = client_write.shutdown().await {
        debug!(error = %e, "Client shutdown failed");
    }

    RelayOutcome {
        closed_by,
        client_to_target,
        target_to_client,
        error: result.err(),
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, transferred: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *transferred += n as u64;
    }
}
