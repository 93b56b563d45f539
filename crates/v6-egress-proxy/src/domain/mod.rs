//! Domain layer: configuration, errors and the address ledger.

pub mod config;
pub mod error;
pub mod ledger;

pub use config::{
    AdminConfig, ListenConfig, LoggingConfig, ProxyConfig, ReclaimConfig, TunnelConfig,
    DEFAULT_CONFIG_FILE,
};
pub use error::{ConfigError, LedgerError, ProxyError, TunnelError, TunnelErrorKind};
pub use ledger::{AddressLease, AddressLedger, AddressSnapshot, InterfaceGuard, LedgerStats};
