//! System interaction: interface control, IP forwarding, NAT rules and the
//! default-route probe.
//!
//! The coordinator only sees the [`InterfaceControl`] and [`ForwardingControl`]
//! traits; the Linux implementations live in the submodules.

pub mod command;
pub mod link;
pub mod nat;
pub mod probe;
pub mod sysctl;

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::Result;

pub use link::IpLink;
pub use nat::NatForwarding;
pub use probe::UpstreamProbe;
pub use sysctl::IpForwarding;

/// Current configuration of a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub ipv4_address: Option<Ipv4Addr>,
    pub prefix_len: Option<u8>,
    pub is_up: bool,
}

/// OS-level network interface control.
#[async_trait]
pub trait InterfaceControl: Send + Sync {
    async fn set_interface_up(&self, name: &str) -> Result<()>;

    async fn set_interface_down(&self, name: &str) -> Result<()>;

    async fn get_interface_config(&self, name: &str) -> Result<InterfaceConfig>;
}

/// Forwarding/NAT between a downstream and an upstream interface.
#[async_trait]
pub trait ForwardingControl: Send + Sync {
    async fn apply(&self, downstream: &str, upstream: &str) -> Result<()>;

    async fn remove(&self, downstream: &str, upstream: &str) -> Result<()>;
}
