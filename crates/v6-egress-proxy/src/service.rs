//! Proxy service - wires the ledger, tunnel server, scheduler and admin
//! server together and owns their shutdown.

use crate::domain::config::ProxyConfig;
use crate::domain::error::ProxyError;
use crate::domain::ledger::AddressLedger;
use crate::metrics::ProxyMetrics;
use crate::ports::{InterfaceBinder, OutboundDialer};
use crate::reclaim::ReclamationScheduler;
use crate::tunnel::{self, TunnelHandler};
use axum::{response::IntoResponse, routing::get, Json, Router};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Resolves once `shutdown` holds true or its sender is gone.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Proxy service state
pub struct ProxyService {
    config: ProxyConfig,
    ledger: Arc<AddressLedger>,
    handler: Arc<TunnelHandler>,
    scheduler: Arc<ReclamationScheduler>,
    metrics: Arc<ProxyMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyService {
    /// Create a new proxy service
    pub fn new(
        config: ProxyConfig,
        binder: Arc<dyn InterfaceBinder>,
        dialer: Arc<dyn OutboundDialer>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;

        let metrics = Arc::new(ProxyMetrics::new());
        let ledger = Arc::new(AddressLedger::new(Arc::clone(&binder)));

        let handler = Arc::new(TunnelHandler::new(
            Arc::clone(&ledger),
            dialer,
            Arc::clone(&metrics),
            &config.proxy,
            config.tunnel.clone(),
        )?);

        let scheduler = Arc::new(ReclamationScheduler::new(
            Arc::clone(&ledger),
            binder,
            Arc::clone(&metrics),
            config.reclaim.clone(),
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            ledger,
            handler,
            scheduler,
            metrics,
            shutdown_tx,
        })
    }

    /// Bind the configured proxy address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ProxyError> {
        info!(
            interface = %self.config.proxy.interface,
            subnet = self.config.proxy.subnet,
            default_source = %self.config.proxy.temp_ip,
            "Starting proxy..."
        );

        let scheduler_handle = tokio::spawn(
            Arc::clone(&self.scheduler).run(self.shutdown_tx.subscribe()),
        );

        let admin_handle = match self.start_admin().await {
            Ok(handle) => handle,
            Err(e) => {
                self.shutdown();
                let _ = scheduler_handle.await;
                return Err(e);
            }
        };

        let result = tunnel::serve(
            listener,
            Arc::clone(&self.handler),
            self.shutdown_tx.subscribe(),
        )
        .await;

        // The listener may also stop on its own; take the rest down with it.
        self.shutdown();

        if let Err(e) = scheduler_handle.await {
            error!(error = %e, "Reclamation scheduler task failed");
        }
        if let Some(handle) = admin_handle {
            match handle.await {
                Ok(Err(e)) => error!(error = %e, "Admin server error"),
                Err(e) => error!(error = %e, "Admin server task failed"),
                Ok(Ok(())) => {}
            }
        }

        info!("Proxy stopped");
        result.map_err(ProxyError::from)
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Get the address ledger
    pub fn ledger(&self) -> Arc<AddressLedger> {
        Arc::clone(&self.ledger)
    }

    /// Get metrics
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Build Admin router
    pub fn admin_router(&self) -> Router {
        let metrics = Arc::clone(&self.metrics);
        let scheduler = Arc::clone(&self.scheduler);
        let ledger = Arc::clone(&self.ledger);

        Router::new()
            .route("/health", get(health_check))
            .route(
                "/metrics",
                get(move || {
                    let metrics = Arc::clone(&metrics);
                    let scheduler = Arc::clone(&scheduler);
                    async move {
                        let mut body = metrics.to_json();
                        body["last_sweep"] = serde_json::json!(scheduler.last_report());
                        Json(body)
                    }
                }),
            )
            .route(
                "/addresses",
                get(move || {
                    let ledger = Arc::clone(&ledger);
                    async move {
                        let stats = ledger.stats();
                        Json(serde_json::json!({
                            "count": ledger.len(),
                            "addresses": ledger.snapshot(),
                            "stats": {
                                "allocations": stats.allocations.load(Ordering::Relaxed),
                                "provisioned": stats.provisioned.load(Ordering::Relaxed),
                                "provision_failures": stats.provision_failures.load(Ordering::Relaxed),
                                "releases": stats.releases.load(Ordering::Relaxed),
                                "evictions": stats.evictions.load(Ordering::Relaxed),
                                "requeued": stats.requeued.load(Ordering::Relaxed),
                            }
                        }))
                    }
                }),
            )
    }

    async fn start_admin(&self) -> Result<Option<JoinHandle<std::io::Result<()>>>, ProxyError> {
        if !self.config.admin.enabled {
            return Ok(None);
        }

        let addr = self.config.admin_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        info!(addr = %addr, "Starting Admin server");

        let router = self.admin_router();
        let mut shutdown = self.shutdown_tx.subscribe();
        Ok(Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown_signalled(&mut shutdown).await })
                .await
        })))
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}
