//! In-memory doubles for unit tests.

use crate::ports::{BinderError, InterfaceBinder, OutboundDialer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

/// Binder that records calls instead of touching the interface.
#[derive(Default)]
pub struct RecordingBinder {
    provisioned: Mutex<Vec<Ipv6Addr>>,
    released: Mutex<Vec<Ipv6Addr>>,
    provision_calls: AtomicU64,
    release_calls: AtomicU64,
    fail_provision: Mutex<HashSet<Ipv6Addr>>,
    fail_release: Mutex<HashSet<Ipv6Addr>>,
    delay: Option<Duration>,
    per_address_delay: Mutex<HashMap<Ipv6Addr, Duration>>,
}

impl RecordingBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_provision(&self, address: Ipv6Addr) {
        self.fail_provision.lock().insert(address);
    }

    pub fn fail_release(&self, address: Ipv6Addr) {
        self.fail_release.lock().insert(address);
    }

    pub fn clear_failures(&self) {
        self.fail_provision.lock().clear();
        self.fail_release.lock().clear();
    }

    pub fn delay_for(&self, address: Ipv6Addr, delay: Duration) {
        self.per_address_delay.lock().insert(address, delay);
    }

    pub fn provisioned(&self) -> Vec<Ipv6Addr> {
        self.provisioned.lock().clone()
    }

    pub fn released(&self) -> Vec<Ipv6Addr> {
        self.released.lock().clone()
    }

    pub fn provision_calls(&self) -> u64 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> u64 {
        self.release_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self, address: Ipv6Addr) {
        let delay = self
            .per_address_delay
            .lock()
            .get(&address)
            .copied()
            .or(self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl InterfaceBinder for RecordingBinder {
    async fn provision_address(&self, address: Ipv6Addr) -> Result<(), BinderError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(address).await;
        if self.fail_provision.lock().contains(&address) {
            return Err(BinderError::CommandFailed {
                command: format!("ip -6 addr add {address}/64 dev test0"),
                status: "exit status: 2".into(),
                stderr: "RTNETLINK answers: Permission denied".into(),
            });
        }
        self.provisioned.lock().push(address);
        Ok(())
    }

    async fn release_address(&self, address: Ipv6Addr) -> Result<(), BinderError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_release.lock().contains(&address) {
            return Err(BinderError::CommandFailed {
                command: format!("ip -6 addr del {address}/64 dev test0"),
                status: "exit status: 2".into(),
                stderr: "RTNETLINK answers: Device or resource busy".into(),
            });
        }
        self.released.lock().push(address);
        Ok(())
    }
}

/// Dialer that fails a set number of times, then connects to a fixed local
/// listener regardless of the requested target.
pub struct ScriptedDialer {
    target: SocketAddr,
    failures: AtomicU32,
    hang: bool,
    calls: AtomicU32,
    sources: Mutex<Vec<Ipv6Addr>>,
}

impl ScriptedDialer {
    pub fn new(target: SocketAddr) -> Self {
        Self::failing_first(target, 0)
    }

    pub fn failing_first(target: SocketAddr, failures: u32) -> Self {
        Self {
            target,
            failures: AtomicU32::new(failures),
            hang: false,
            calls: AtomicU32::new(0),
            sources: Mutex::new(Vec::new()),
        }
    }

    /// Never completes a dial.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::failing_first(SocketAddr::from(([127, 0, 0, 1], 9)), 0)
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sources(&self) -> Vec<Ipv6Addr> {
        self.sources.lock().clone()
    }
}

#[async_trait]
impl OutboundDialer for ScriptedDialer {
    async fn dial(&self, source: Ipv6Addr, _target: &str) -> io::Result<TcpStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().push(source);

        if self.hang {
            std::future::pending::<()>().await;
        }

        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }

        TcpStream::connect(self.target).await
    }
}
