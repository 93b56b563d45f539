//! Adapters for the proxy.
//!
//! Host implementations of the outbound ports.

pub mod ip_command;
pub mod tcp_dialer;

pub use ip_command::IpCommandBinder;
pub use tcp_dialer::BoundTcpDialer;
