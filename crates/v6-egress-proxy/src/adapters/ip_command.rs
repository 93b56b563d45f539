//! Interface binder backed by the `ip` command.
//!
//! Runs `ip -6 addr add|del <addr>/<prefix> dev <interface>`. Both directions
//! are idempotent: "already present" on add and "not present" on delete are
//! treated as success.

use crate::domain::config::ListenConfig;
use crate::ports::{BinderError, InterfaceBinder};
use async_trait::async_trait;
use std::net::Ipv6Addr;
use tokio::process::Command;
use tracing::{debug, warn};

/// stderr fragments meaning the address is already on the interface
const ADD_TOLERATED: &[&str] = &["File exists"];

/// stderr fragments meaning the address is already gone
const DEL_TOLERATED: &[&str] = &["Cannot assign requested address", "No such"];

#[derive(Debug, Clone)]
pub struct IpCommandBinder {
    program: String,
    interface: String,
    prefix_len: u8,
    skip_dad: bool,
}

impl IpCommandBinder {
    pub fn new(interface: impl Into<String>, prefix_len: u8, skip_dad: bool) -> Self {
        Self {
            program: "ip".to_string(),
            interface: interface.into(),
            prefix_len,
            skip_dad,
        }
    }

    pub fn from_config(config: &ListenConfig) -> Self {
        Self::new(config.interface.clone(), config.subnet, config.skip_dad)
    }

    /// Use a different executable instead of `ip` from `PATH`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn add_args(&self, address: Ipv6Addr) -> Vec<String> {
        let mut args = self.base_args("add", address);
        if self.skip_dad {
            args.push("nodad".to_string());
        }
        args
    }

    fn del_args(&self, address: Ipv6Addr) -> Vec<String> {
        self.base_args("del", address)
    }

    fn base_args(&self, verb: &str, address: Ipv6Addr) -> Vec<String> {
        vec![
            "-6".to_string(),
            "addr".to_string(),
            verb.to_string(),
            format!("{}/{}", address, self.prefix_len),
            "dev".to_string(),
            self.interface.clone(),
        ]
    }

    async fn run(&self, args: &[String], tolerated: &[&str]) -> Result<(), BinderError> {
        let command = format!("{} {}", self.program, args.join(" "));
        debug!(command = %command, "Running interface command");

        let out = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BinderError::Spawn {
                command: command.clone(),
                source,
            })?;

        if out.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        if is_tolerated(&stderr, tolerated) {
            debug!(command = %command, stderr = %stderr, "Interface already in requested state");
            return Ok(());
        }

        warn!(command = %command, status = %out.status, stderr = %stderr, "Interface command failed");
        Err(BinderError::CommandFailed {
            command,
            status: out.status.to_string(),
            stderr: if stderr.is_empty() {
                "unknown error".to_string()
            } else {
                stderr
            },
        })
    }
}

fn is_tolerated(stderr: &str, tolerated: &[&str]) -> bool {
    tolerated.iter().any(|fragment| stderr.contains(fragment))
}

#[async_trait]
impl InterfaceBinder for IpCommandBinder {
    async fn provision_address(&self, address: Ipv6Addr) -> Result<(), BinderError> {
        // The wildcard address means "let the kernel pick"; nothing to add.
        if address.is_unspecified() {
            return Ok(());
        }
        self.run(&self.add_args(address), ADD_TOLERATED).await
    }

    async fn release_address(&self, address: Ipv6Addr) -> Result<(), BinderError> {
        if address.is_unspecified() {
            return Ok(());
        }
        self.run(&self.del_args(address), DEL_TOLERATED).await
    }
}
