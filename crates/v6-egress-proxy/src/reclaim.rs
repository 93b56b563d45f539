//! Reclamation Scheduler - removes idle addresses from the interface.
//!
//! Runs on a fixed interval. Each tick evicts idle entries from the ledger
//! and deletes them from the interface. A failed delete puts the address
//! back in the ledger, flagged for the next tick.

use crate::domain::config::ReclaimConfig;
use crate::domain::ledger::AddressLedger;
use crate::metrics::ProxyMetrics;
use crate::ports::InterfaceBinder;
use crate::service::shutdown_signalled;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Sweeping,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries taken out of the ledger
    pub evicted: usize,
    /// Addresses removed from the interface
    pub released: usize,
    /// Removals that failed and were put back for retry
    pub requeued: usize,
    /// Addresses re-allocated before removal, left on the interface
    pub kept: usize,
}

pub struct ReclamationScheduler {
    ledger: Arc<AddressLedger>,
    binder: Arc<dyn InterfaceBinder>,
    metrics: Arc<ProxyMetrics>,
    config: ReclaimConfig,
    state: Mutex<SchedulerState>,
    last_report: Mutex<Option<SweepReport>>,
}

impl ReclamationScheduler {
    pub fn new(
        ledger: Arc<AddressLedger>,
        binder: Arc<dyn InterfaceBinder>,
        metrics: Arc<ProxyMetrics>,
        config: ReclaimConfig,
    ) -> Self {
        Self {
            ledger,
            binder,
            metrics,
            config,
            state: Mutex::new(SchedulerState::Idle),
            last_report: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// Report of the most recent sweep, if one has run.
    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().clone()
    }

    /// Run one sweep as of `now`.
    pub async fn sweep_once(&self, now: Instant) -> SweepReport {
        *self.state.lock() = SchedulerState::Sweeping;

        let evicted = self.ledger.sweep_idle(self.config.idle_ttl, now);
        let mut report = SweepReport {
            evicted: evicted.len(),
            ..SweepReport::default()
        };

        for address in evicted {
            let _guard = self.ledger.lock_interface(address).await;

            if self.ledger.contains(address) {
                debug!(address = %address, "Address re-allocated before removal, keeping");
                report.kept += 1;
                continue;
            }

            match self.binder.release_address(address).await {
                Ok(()) => {
                    info!(address = %address, "Address reclaimed");
                    report.released += 1;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to remove address, will retry");
                    if self.ledger.requeue(address) {
                        report.requeued += 1;
                    } else {
                        report.kept += 1;
                    }
                }
            }
        }

        self.metrics
            .record_reclaim(report.released as u64, report.requeued as u64);
        *self.last_report.lock() = Some(report.clone());
        *self.state.lock() = SchedulerState::Idle;
        report
    }

    /// Sweep on every interval tick until `shutdown` flips to true or its
    /// sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval = ?self.config.interval,
            idle_ttl = ?self.config.idle_ttl,
            "Reclamation scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_once(Instant::now()).await;
                    if report.evicted > 0 {
                        info!(
                            evicted = report.evicted,
                            released = report.released,
                            requeued = report.requeued,
                            kept = report.kept,
                            "Sweep finished"
                        );
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }

        info!("Reclamation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingBinder;
    use std::net::Ipv6Addr;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        binder: Arc<RecordingBinder>,
        ledger: Arc<AddressLedger>,
        metrics: Arc<ProxyMetrics>,
    }

    fn fixture() -> Fixture {
        let binder = Arc::new(RecordingBinder::new());
        let ledger = Arc::new(AddressLedger::new(
            Arc::clone(&binder) as Arc<dyn InterfaceBinder>
        ));
        Fixture {
            binder,
            ledger,
            metrics: Arc::new(ProxyMetrics::new()),
        }
    }

    fn scheduler(f: &Fixture, config: ReclaimConfig) -> ReclamationScheduler {
        ReclamationScheduler::new(
            Arc::clone(&f.ledger),
            Arc::clone(&f.binder) as Arc<dyn InterfaceBinder>,
            Arc::clone(&f.metrics),
            config,
        )
    }

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_idle_address_removed_from_interface() {
        let f = fixture();
        let scheduler = scheduler(&f, ReclaimConfig::default());
        let a = addr("2001:db8::1");
        f.ledger.allocate(a).await.unwrap().release().unwrap();

        let report = scheduler
            .sweep_once(Instant::now() + Duration::from_secs(121))
            .await;

        assert_eq!(
            report,
            SweepReport {
                evicted: 1,
                released: 1,
                requeued: 0,
                kept: 0
            }
        );
        assert_eq!(f.binder.released(), vec![a]);
        assert!(!f.ledger.contains(a));
        assert_eq!(f.metrics.addresses_reclaimed.load(Ordering::Relaxed), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_recent_address_kept() {
        let f = fixture();
        let scheduler = scheduler(&f, ReclaimConfig::default());
        let a = addr("2001:db8::2");
        f.ledger.allocate(a).await.unwrap().release().unwrap();

        assert_eq!(scheduler.last_report(), None);
        let report = scheduler
            .sweep_once(Instant::now() + Duration::from_secs(60))
            .await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(scheduler.last_report(), Some(SweepReport::default()));
        assert_eq!(f.binder.release_calls(), 0);
        assert!(f.ledger.contains(a));
    }

    #[tokio::test]
    async fn test_active_address_never_removed() {
        let f = fixture();
        let scheduler = scheduler(&f, ReclaimConfig::default());
        let a = addr("2001:db8::3");
        let _lease = f.ledger.allocate(a).await.unwrap();

        let report = scheduler
            .sweep_once(Instant::now() + Duration::from_secs(3600))
            .await;
        assert_eq!(report.evicted, 0);
        assert_eq!(f.binder.release_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_removal_retried_next_sweep() {
        let f = fixture();
        let scheduler = scheduler(&f, ReclaimConfig::default());
        let a = addr("2001:db8::4");
        f.ledger.allocate(a).await.unwrap().release().unwrap();
        f.binder.fail_release(a);

        let report = scheduler
            .sweep_once(Instant::now() + Duration::from_secs(121))
            .await;
        assert_eq!(report.requeued, 1);
        assert!(f.ledger.contains(a));
        assert_eq!(f.ledger.active_tunnels(a), Some(0));
        assert_eq!(f.metrics.reclaim_failures.load(Ordering::Relaxed), 1);

        // Retried without waiting another full TTL.
        f.binder.clear_failures();
        let report = scheduler.sweep_once(Instant::now()).await;
        assert_eq!(report.released, 1);
        assert_eq!(f.binder.released(), vec![a]);
        assert!(!f.ledger.contains(a));
    }

    #[tokio::test]
    async fn test_run_sweeps_and_stops() {
        let f = fixture();
        let config = ReclaimConfig {
            interval: Duration::from_millis(20),
            idle_ttl: Duration::from_millis(1),
        };
        let scheduler = Arc::new(scheduler(&f, config));
        let a = addr("2001:db8::5");
        f.ledger.allocate(a).await.unwrap().release().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.binder.released().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.binder.released(), vec![a]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_when_sender_dropped() {
        let f = fixture();
        let scheduler = Arc::new(scheduler(&f, ReclaimConfig::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
