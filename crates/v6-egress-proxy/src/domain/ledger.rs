//! Address Ledger - authoritative record of provisioned source addresses.
//!
//! Maps each IPv6 source address to its last-use time and the number of
//! tunnels currently egressing from it.
//!
//! Flow:
//! 1. Tunnel handler calls `allocate()` and receives an `AddressLease`
//! 2. First allocation of an address provisions it on the interface
//! 3. Dropping the lease decrements the active tunnel count
//! 4. The reclamation scheduler calls `sweep_idle()` to evict unused entries
//!
//! The table is a sharded map. Guards are never held across an `.await`:
//! interface calls run outside the map under a per-address async lock, so a
//! slow `ip addr add` for one address never stalls another.

use crate::domain::error::LedgerError;
use crate::ports::InterfaceBinder;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Shared result of the single interface add for one ledger entry.
type ProvisionOutcome = Result<(), String>;

/// One provisioned source address
struct AddressEntry {
    /// Most recent allocation or release
    last_seen_at: Instant,
    /// Tunnels currently using this address
    active_tunnels: u64,
    /// Outcome of the interface add, shared by concurrent allocators
    provisioned: Arc<OnceCell<ProvisionOutcome>>,
    /// A previous interface removal failed; retry on the next sweep
    release_pending: bool,
}

impl AddressEntry {
    fn new(now: Instant) -> Self {
        Self {
            last_seen_at: now,
            active_tunnels: 0,
            provisioned: Arc::new(OnceCell::new()),
            release_pending: false,
        }
    }

    /// Entry for an address still present on the interface after a failed
    /// removal.
    fn requeued(now: Instant) -> Self {
        Self {
            last_seen_at: now,
            active_tunnels: 0,
            provisioned: Arc::new(OnceCell::new_with(Some(Ok(())))),
            release_pending: true,
        }
    }
}

/// Statistics for the ledger
#[derive(Debug, Default)]
pub struct LedgerStats {
    /// Total allocate calls
    pub allocations: AtomicU64,
    /// Successful interface adds
    pub provisioned: AtomicU64,
    /// Failed interface adds
    pub provision_failures: AtomicU64,
    /// Total successful releases
    pub releases: AtomicU64,
    /// Entries removed by sweeps
    pub evictions: AtomicU64,
    /// Entries re-inserted after a failed interface removal
    pub requeued: AtomicU64,
}

/// Point-in-time view of one ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressSnapshot {
    pub address: Ipv6Addr,
    pub active_tunnels: u64,
    pub idle_secs: u64,
    pub release_pending: bool,
}

/// In-memory ledger of source addresses.
///
/// Construct one per process and share it behind an `Arc`.
pub struct AddressLedger {
    entries: DashMap<Ipv6Addr, AddressEntry>,
    /// Serializes interface add/remove for the same address
    interface_locks: DashMap<Ipv6Addr, Arc<AsyncMutex<()>>>,
    binder: Arc<dyn InterfaceBinder>,
    stats: LedgerStats,
}

impl AddressLedger {
    pub fn new(binder: Arc<dyn InterfaceBinder>) -> Self {
        Self {
            entries: DashMap::new(),
            interface_locks: DashMap::new(),
            binder,
            stats: LedgerStats::default(),
        }
    }

    /// Register one more tunnel on `address`, provisioning it on the
    /// interface if this is the first use.
    ///
    /// On provisioning failure the entry is rolled back and the error is
    /// returned. Dropping the returned future before it resolves also rolls
    /// back the increment.
    pub async fn allocate(self: &Arc<Self>, address: Ipv6Addr) -> Result<AddressLease, LedgerError> {
        let cell = self.register(address);
        let mut pending = PendingAllocation {
            ledger: self,
            address,
            cell: Arc::clone(&cell),
            committed: false,
        };

        match cell.get_or_init(|| self.provision(address)).await {
            Ok(()) => {
                pending.committed = true;
                debug!(address = %address, "Address allocated");
                Ok(AddressLease {
                    ledger: Arc::clone(self),
                    address,
                    released: false,
                })
            }
            Err(reason) => Err(LedgerError::Provision {
                address,
                reason: reason.clone(),
            }),
        }
    }

    /// Decrement the active tunnel count of `address`.
    pub fn release(&self, address: Ipv6Addr) -> Result<(), LedgerError> {
        let mut entry = self
            .entries
            .get_mut(&address)
            .ok_or(LedgerError::NotFound(address))?;

        if entry.active_tunnels == 0 {
            return Err(LedgerError::NoActiveTunnels(address));
        }

        entry.active_tunnels -= 1;
        entry.last_seen_at = Instant::now();
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove and return every entry with no active tunnels that has been
    /// idle for at least `ttl`, or whose previous removal failed.
    pub fn sweep_idle(&self, ttl: Duration, now: Instant) -> Vec<Ipv6Addr> {
        let mut evicted = Vec::new();

        self.entries.retain(|address, entry| {
            if entry.active_tunnels > 0 {
                return true;
            }
            let idle = now.saturating_duration_since(entry.last_seen_at);
            if entry.release_pending || idle >= ttl {
                debug!(
                    address = %address,
                    idle_secs = idle.as_secs(),
                    release_pending = entry.release_pending,
                    "Evicting idle address"
                );
                evicted.push(*address);
                false
            } else {
                true
            }
        });

        self.stats
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    /// Put back an address whose interface removal failed so the next sweep
    /// retries it. Returns false if the address was re-allocated meanwhile.
    pub fn requeue(&self, address: Ipv6Addr) -> bool {
        match self.entries.entry(address) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(AddressEntry::requeued(Instant::now()));
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Acquire the per-address interface lock.
    ///
    /// Held while adding or removing `address` on the interface.
    pub async fn lock_interface(&self, address: Ipv6Addr) -> InterfaceGuard<'_> {
        let lock = Arc::clone(
            self.interface_locks
                .entry(address)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        );
        let guard = lock.lock_owned().await;
        InterfaceGuard {
            ledger: self,
            address,
            guard: Some(guard),
        }
    }

    /// Check if an address is in the ledger
    pub fn contains(&self, address: Ipv6Addr) -> bool {
        self.entries.contains_key(&address)
    }

    /// Active tunnel count of an address, `None` if unknown
    pub fn active_tunnels(&self, address: Ipv6Addr) -> Option<u64> {
        self.entries.get(&address).map(|entry| entry.active_tunnels)
    }

    /// Number of addresses in the ledger
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, sorted by address
    pub fn snapshot(&self) -> Vec<AddressSnapshot> {
        let now = Instant::now();
        let mut snapshot: Vec<_> = self
            .entries
            .iter()
            .map(|entry| AddressSnapshot {
                address: *entry.key(),
                active_tunnels: entry.active_tunnels,
                idle_secs: now.saturating_duration_since(entry.last_seen_at).as_secs(),
                release_pending: entry.release_pending,
            })
            .collect();
        snapshot.sort_by_key(|s| s.address);
        snapshot
    }

    /// Get statistics
    pub fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    fn register(&self, address: Ipv6Addr) -> Arc<OnceCell<ProvisionOutcome>> {
        let now = Instant::now();
        let mut entry = self.entries.entry(address).or_insert_with(|| {
            info!(address = %address, "Address added to ledger");
            AddressEntry::new(now)
        });
        entry.active_tunnels += 1;
        entry.last_seen_at = now;
        entry.release_pending = false;
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&entry.provisioned)
    }

    async fn provision(&self, address: Ipv6Addr) -> ProvisionOutcome {
        let _guard = self.lock_interface(address).await;
        match self.binder.provision_address(address).await {
            Ok(()) => {
                self.stats.provisioned.fetch_add(1, Ordering::Relaxed);
                info!(address = %address, "Address provisioned on interface");
                Ok(())
            }
            Err(e) => {
                self.stats.provision_failures.fetch_add(1, Ordering::Relaxed);
                warn!(address = %address, error = %e, "Failed to provision address");
                Err(e.to_string())
            }
        }
    }

    /// Undo one `register()` for the entry that owns `cell`.
    fn rollback(&self, address: Ipv6Addr, cell: &Arc<OnceCell<ProvisionOutcome>>) {
        if let Entry::Occupied(mut occupied) = self.entries.entry(address) {
            if !Arc::ptr_eq(&occupied.get().provisioned, cell) {
                return;
            }
            // Failed or cancelled before the add finished: the address is
            // not on the interface, so an unused entry must not outlive us.
            let provisioned = matches!(cell.get(), Some(Ok(())));
            let entry = occupied.get_mut();
            entry.active_tunnels = entry.active_tunnels.saturating_sub(1);
            if !provisioned && entry.active_tunnels == 0 {
                occupied.remove();
                debug!(address = %address, "Rolled back unprovisioned allocation");
            }
        }
    }
}

/// Rolls back an allocation that did not complete.
struct PendingAllocation<'a> {
    ledger: &'a AddressLedger,
    address: Ipv6Addr,
    cell: Arc<OnceCell<ProvisionOutcome>>,
    committed: bool,
}

impl Drop for PendingAllocation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ledger.rollback(self.address, &self.cell);
        }
    }
}

/// Exclusive right to add or remove one address on the interface.
pub struct InterfaceGuard<'a> {
    ledger: &'a AddressLedger,
    address: Ipv6Addr,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InterfaceGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left means nobody is waiting.
        self.ledger
            .interface_locks
            .remove_if(&self.address, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// One tunnel's claim on a source address.
///
/// Dropping the lease releases it exactly once.
pub struct AddressLease {
    ledger: Arc<AddressLedger>,
    address: Ipv6Addr,
    released: bool,
}

impl AddressLease {
    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    /// Release now and report the outcome instead of logging it.
    pub fn release(mut self) -> Result<(), LedgerError> {
        self.released = true;
        self.ledger.release(self.address)
    }
}

impl std::fmt::Debug for AddressLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressLease")
            .field("address", &self.address)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.ledger.release(self.address) {
            warn!(address = %self.address, error = %e, "Lease release failed");
        }
    }
}
