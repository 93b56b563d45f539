//! Proxy configuration with validation.
//!
//! Configuration is a JSON file read once at startup. A missing file is
//! created with the defaults below before it is read.

use crate::domain::error::ConfigError;
use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Main proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Version tag of the config file
    pub version: String,
    /// Listener and address provisioning
    pub proxy: ListenConfig,
    /// Outbound dial behaviour
    pub tunnel: TunnelConfig,
    /// Idle address reclamation
    pub reclaim: ReclaimConfig,
    /// Admin server (disabled by default)
    pub admin: AdminConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            proxy: ListenConfig::default(),
            tunnel: TunnelConfig::default(),
            reclaim: ReclaimConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Read the config file at `path`, writing the defaults there first if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let io_err = |source| ConfigError::Io {
            path: display.clone(),
            source,
        };

        if !path.exists() {
            let defaults = serde_json::to_string_pretty(&Self::default()).map_err(|source| {
                ConfigError::Parse {
                    path: display.clone(),
                    source,
                }
            })?;
            std::fs::write(path, defaults).map_err(io_err)?;
            info!(path = %path.display(), "Wrote default config file");
        }

        let raw = std::fs::read_to_string(path).map_err(io_err)?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display.clone(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.port == 0 {
            return Err(ConfigError::Invalid("proxy.port cannot be 0".into()));
        }

        if self.proxy.subnet == 0 || self.proxy.subnet > 128 {
            return Err(ConfigError::Invalid(format!(
                "proxy.subnet must be within 1..=128, got {}",
                self.proxy.subnet
            )));
        }

        if self.proxy.interface.trim().is_empty() {
            return Err(ConfigError::Invalid("proxy.interface cannot be empty".into()));
        }

        if HeaderName::from_bytes(self.proxy.source_header.as_bytes()).is_err() {
            return Err(ConfigError::Invalid(format!(
                "proxy.source_header {:?} is not a valid header name",
                self.proxy.source_header
            )));
        }

        if self.tunnel.dial_attempts == 0 {
            return Err(ConfigError::Invalid("tunnel.dial_attempts cannot be 0".into()));
        }

        if self.tunnel.dial_timeout.is_zero() {
            return Err(ConfigError::Invalid("tunnel.dial_timeout cannot be 0".into()));
        }

        if self.tunnel.max_backoff < self.tunnel.initial_backoff {
            return Err(ConfigError::Invalid(
                "tunnel.max_backoff cannot be smaller than tunnel.initial_backoff".into(),
            ));
        }

        if self.reclaim.interval.is_zero() {
            return Err(ConfigError::Invalid("reclaim.interval cannot be 0".into()));
        }

        if self.reclaim.idle_ttl.is_zero() {
            return Err(ConfigError::Invalid("reclaim.idle_ttl cannot be 0".into()));
        }

        if self.admin.enabled && self.admin_addr() == self.listen_addr() {
            return Err(ConfigError::Invalid(
                "admin server cannot share the proxy listen address".into(),
            ));
        }

        Ok(())
    }

    /// Proxy listener address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.proxy.host, self.proxy.port)
    }

    /// Admin listener address
    pub fn admin_addr(&self) -> SocketAddr {
        SocketAddr::new(self.admin.host, self.admin.port)
    }
}

/// Listener and interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind address
    pub host: IpAddr,
    /// Port (default: 8080)
    pub port: u16,
    /// Source address used when a request carries no override header
    pub temp_ip: Ipv6Addr,
    /// Network interface the source addresses are added to
    pub interface: String,
    /// Prefix length used when adding addresses
    pub subnet: u8,
    /// Request header carrying the per-tunnel source address
    pub source_header: String,
    /// Add addresses with `nodad` so they are usable immediately
    pub skip_dad: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            temp_ip: Ipv6Addr::UNSPECIFIED,
            interface: "ens3".to_string(),
            subnet: 64,
            source_header: "x-proxy-ip".to_string(),
            skip_dad: false,
        }
    }
}

/// Outbound dial settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Timeout of a single dial attempt
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// Maximum number of dial attempts per tunnel
    pub dial_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound for the doubling backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            dial_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Idle address reclamation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Sweep interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Idle time after which an unused address is removed
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            idle_ttl: Duration::from_secs(120),
        }
    }
}

/// Admin server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin server
    pub enabled: bool,
    /// Bind address (localhost only by default)
    pub host: IpAddr,
    /// Port (default: 8081)
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8081,
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
