//! v6-egress-proxy - HTTP CONNECT proxy with per-tunnel IPv6 source
//! addresses.
//!
//! Every tunnel egresses from an IPv6 address picked by the client (request
//! header) or from the configured default. Addresses are added to the
//! network interface on first use and removed once they have been idle for
//! the configured TTL.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        PROXY SERVICE                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐     ┌──────────────┐     ┌──────────────┐   │
//! │  │ Tunnel Server│     │ Reclamation  │     │    Admin     │   │
//! │  │  (CONNECT)   │     │  Scheduler   │     │  (optional)  │   │
//! │  └──────┬───────┘     └──────┬───────┘     └──────┬───────┘   │
//! │         │ allocate/release   │ sweep_idle         │ snapshot  │
//! │  ┌──────┴────────────────────┴────────────────────┴───────┐   │
//! │  │                    Address Ledger                      │   │
//! │  └──────────────────────────┬─────────────────────────────┘   │
//! └─────────────────────────────┼─────────────────────────────────┘
//!                               │ provision / release
//!                      ┌────────┴────────┐
//!                      │ InterfaceBinder │  (`ip -6 addr add|del`)
//!                      └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use v6_egress_proxy::adapters::{BoundTcpDialer, IpCommandBinder};
//! use v6_egress_proxy::{ProxyConfig, ProxyService};
//!
//! let config = ProxyConfig::load_or_create("config.json".as_ref())?;
//! let binder = Arc::new(IpCommandBinder::from_config(&config.proxy));
//! let service = ProxyService::new(config, binder, Arc::new(BoundTcpDialer::new()))?;
//! service.run().await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod metrics;
pub mod ports;
pub mod reclaim;
pub mod service;
pub mod telemetry;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports
pub use domain::config::{ProxyConfig, DEFAULT_CONFIG_FILE};
pub use domain::error::{ConfigError, LedgerError, ProxyError, TunnelError};
pub use domain::ledger::{AddressLease, AddressLedger};
pub use metrics::ProxyMetrics;
pub use ports::{BinderError, InterfaceBinder, OutboundDialer};
pub use reclaim::{ReclamationScheduler, SweepReport};
pub use service::ProxyService;
pub use tunnel::TunnelHandler;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(ProxyConfig::default().version, VERSION);
    }
}
