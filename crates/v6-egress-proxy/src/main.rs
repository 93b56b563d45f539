//! v6-egress-proxy binary.
//!
//! Loads (or creates) the config file, installs logging and runs the proxy
//! until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use v6_egress_proxy::adapters::{BoundTcpDialer, IpCommandBinder};
use v6_egress_proxy::telemetry::init_logging;
use v6_egress_proxy::{ProxyConfig, ProxyService, DEFAULT_CONFIG_FILE, VERSION};

/// HTTP CONNECT proxy with per-tunnel IPv6 source addresses
#[derive(Parser, Debug)]
#[command(name = "v6-egress-proxy", version)]
#[command(about = "HTTP CONNECT proxy that egresses each tunnel from its own IPv6 address")]
struct Args {
    /// Config file, created with defaults if missing
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ProxyConfig::load_or_create(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    init_logging(&config.logging).context("initializing logging")?;
    info!(version = VERSION, config = %args.config.display(), "v6-egress-proxy starting");

    let binder = Arc::new(IpCommandBinder::from_config(&config.proxy));
    let dialer = Arc::new(BoundTcpDialer::new());
    let service =
        Arc::new(ProxyService::new(config, binder, dialer).context("building proxy service")?);

    let runner = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run().await })
    };
    tokio::pin!(runner);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl+C")?;
            info!("Received shutdown signal");
            service.shutdown();
        }
        result = &mut runner => {
            // Stopped without a signal: bind failure or listener error.
            let result = result.context("proxy task panicked")?;
            if let Err(e) = &result {
                error!(error = %e, "Proxy stopped unexpectedly");
            }
            return result.context("running proxy");
        }
    }

    runner
        .await
        .context("proxy task panicked")?
        .context("running proxy")?;
    Ok(())
}
