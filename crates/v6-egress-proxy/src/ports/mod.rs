//! Ports layer: traits the core depends on, implemented in `adapters`.

pub mod outbound;

pub use outbound::{BinderError, InterfaceBinder, OutboundDialer};
