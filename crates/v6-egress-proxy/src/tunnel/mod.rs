//! Tunnel server: HTTP/1.1 listener that turns CONNECT requests into relayed
//! TCP tunnels.
//!
//! Each accepted connection runs on its own task. Connections are served
//! with upgrades enabled so a successful CONNECT can take over the raw
//! socket after the 200.

pub mod handler;
pub mod relay;

pub use handler::{connect_target, TunnelHandler};
pub use relay::{relay, ClosedBy, RelayOutcome};

use crate::service::shutdown_signalled;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Back-off after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Accept connections on `listener` until `shutdown` flips to true or its
/// sender goes away. Tunnels already running are left to finish.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<TunnelHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "Proxy listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    tokio::spawn(serve_connection(stream, peer, Arc::clone(&handler)));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            },
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }

    info!("Proxy listener stopped");
    Ok(())
}

async fn serve_connection(stream: TcpStream, peer: std::net::SocketAddr, handler: Arc<TunnelHandler>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!(peer = %peer, error = %e, "Connection ended");
    }
}
