//! CONNECT request handling.
//!
//! A tunnel moves through `Received -> AddressAllocated -> Dialing ->
//! Established -> Relaying -> Closed`. Failures before `Established` become
//! an HTTP error response; after it they can only be logged.

use crate::domain::config::{ListenConfig, TunnelConfig};
use crate::domain::error::{ConfigError, TunnelError, TunnelErrorKind};
use crate::domain::ledger::{AddressLease, AddressLedger};
use crate::metrics::ProxyMetrics;
use crate::ports::OutboundDialer;
use crate::tunnel::relay::relay;
use axum::http::{HeaderMap, HeaderName, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A dialed tunnel waiting for the client connection to be handed over.
struct Established {
    lease: AddressLease,
    stream: TcpStream,
    target: String,
}

pub struct TunnelHandler {
    ledger: Arc<AddressLedger>,
    dialer: Arc<dyn OutboundDialer>,
    metrics: Arc<ProxyMetrics>,
    default_source: Ipv6Addr,
    source_header: HeaderName,
    config: TunnelConfig,
}

impl TunnelHandler {
    pub fn new(
        ledger: Arc<AddressLedger>,
        dialer: Arc<dyn OutboundDialer>,
        metrics: Arc<ProxyMetrics>,
        listen: &ListenConfig,
        config: TunnelConfig,
    ) -> Result<Self, ConfigError> {
        let source_header = HeaderName::from_bytes(listen.source_header.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("proxy.source_header: {e}")))?;

        Ok(Self {
            ledger,
            dialer,
            metrics,
            default_source: listen.temp_ip,
            source_header,
            config,
        })
    }

    /// Serve one request.
    pub async fn handle<B: Send>(&self, mut req: Request<B>) -> Response {
        if req.method() != Method::CONNECT {
            self.metrics.record_rejected();
            debug!(method = %req.method(), uri = %req.uri(), "Rejecting non-CONNECT request");
            return TunnelError::UnsupportedMethod(req.method().to_string()).into_response();
        }

        self.metrics.record_connect();

        let parsed = self.parse_connect(&req);
        let result = match parsed {
            Ok((source, target)) => self.establish(source, target).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(established) => {
                let on_upgrade = hyper::upgrade::on(&mut req);
                self.spawn_relay(on_upgrade, established);
                StatusCode::OK.into_response()
            }
            Err(e) => {
                self.record_failure(&e);
                e.into_response()
            }
        }
    }

    /// Source address for a request: the override header if present,
    /// otherwise the configured default.
    pub fn resolve_source(&self, headers: &HeaderMap) -> Result<Ipv6Addr, TunnelError> {
        let Some(value) = headers.get(&self.source_header) else {
            return Ok(self.default_source);
        };

        let raw = value.to_str().map_err(|_| TunnelError::InvalidSourceAddress {
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            reason: "header value is not visible ASCII".to_string(),
        })?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(self.default_source);
        }

        raw.parse::<Ipv6Addr>().map_err(|e| TunnelError::InvalidSourceAddress {
            value: raw.to_string(),
            reason: if raw.parse::<Ipv4Addr>().is_ok() {
                "IPv4 source addresses are not supported".to_string()
            } else {
                e.to_string()
            },
        })
    }

    /// Dial `target` from `source`, retrying with capped exponential backoff.
    pub async fn dial_with_retry(
        &self,
        source: Ipv6Addr,
        target: &str,
    ) -> Result<TcpStream, TunnelError> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let dial = self.dialer.dial(source, target);
            let last_error = match tokio::time::timeout(self.config.dial_timeout, dial).await {
                Ok(Ok(stream)) => {
                    if attempt > 1 {
                        debug!(destination = %target, attempt, "Dial succeeded after retry");
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out after {:?}", self.config.dial_timeout),
                ),
            };

            if attempt >= self.config.dial_attempts {
                return Err(TunnelError::Dial {
                    target: target.to_string(),
                    source_addr: source,
                    attempts: attempt,
                    last_error,
                });
            }

            debug!(
                destination = %target,
                attempt,
                error = %last_error,
                backoff = ?backoff,
                "Dial failed, retrying"
            );
            self.metrics.record_dial_retry();
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(self.config.max_backoff);
        }
    }

    fn parse_connect<B>(&self, req: &Request<B>) -> Result<(Ipv6Addr, String), TunnelError> {
        let source = self.resolve_source(req.headers())?;
        let target = connect_target(req.uri())?;
        Ok((source, target))
    }

    async fn establish(&self, source: Ipv6Addr, target: String) -> Result<Established, TunnelError> {
        let lease = self.ledger.allocate(source).await?;
        // Dropping the lease on a dial error releases the address.
        let stream = self.dial_with_retry(source, &target).await?;

        Ok(Established {
            lease,
            stream,
            target,
        })
    }

    fn spawn_relay(&self, on_upgrade: OnUpgrade, established: Established) {
        let Established {
            lease,
            stream,
            target,
        } = established;
        let metrics = Arc::clone(&self.metrics);
        let span = info_span!("tunnel", source = %lease.address(), destination = %target);

        tokio::spawn(
            async move {
                let upgraded = match on_upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(e) => {
                        let err = TunnelError::Upgrade(e.to_string());
                        warn!(error = %err, "Tunnel not established, releasing address");
                        drop(lease);
                        return;
                    }
                };

                metrics.record_tunnel_open();
                info!("Tunnel established");

                let outcome = relay(TokioIo::new(upgraded), stream).await;
                metrics.record_tunnel_closed(
                    outcome.client_to_target,
                    outcome.target_to_client,
                    outcome.error.is_some(),
                );

                match outcome.error {
                    Some(e) => warn!(
                        error = %TunnelError::Relay(e),
                        closed_by = ?outcome.closed_by,
                        "Tunnel closed with error"
                    ),
                    None => info!(
                        closed_by = ?outcome.closed_by,
                        sent = outcome.client_to_target,
                        received = outcome.target_to_client,
                        "Tunnel closed"
                    ),
                }

                drop(lease);
            }
            .instrument(span),
        );
    }

    fn record_failure(&self, e: &TunnelError) {
        match e.kind() {
            TunnelErrorKind::ClientRequest => {
                self.metrics.record_rejected();
                info!(error = %e, "Rejected CONNECT request");
            }
            TunnelErrorKind::Allocation => {
                self.metrics.record_allocation_failure();
                error!(error = %e, "Source address allocation failed");
            }
            TunnelErrorKind::Dial => {
                self.metrics.record_dial_failure();
                warn!(error = %e, "Dial failed");
            }
            TunnelErrorKind::Relay => {
                warn!(error = %e, "Tunnel failed");
            }
        }
    }
}

/// `host:port` of a CONNECT request in authority form.
pub fn connect_target(uri: &Uri) -> Result<String, TunnelError> {
    match uri.authority() {
        Some(authority)
            if uri.scheme().is_none()
                && authority.port_u16().is_some()
                && !authority.host().is_empty()
                && !authority.as_str().contains('@') =>
        {
            Ok(authority.as_str().to_string())
        }
        _ => Err(TunnelError::InvalidTarget(uri.to_string())),
    }
}
