//! netshare - tethering coordinator for Linux
//!
//! Shares one upstream connection to downstream interfaces (hotspot, USB,
//! Bluetooth PAN). A single [`Coordinator`] owns the sharing state, supervises
//! one [`DownstreamStateMachine`] per interface and follows the
//! [`UpstreamMonitor`] to keep forwarding bound to the best upstream.

pub mod config;
pub mod coordinator;
pub mod downstream;
pub mod error;
pub mod service;
pub mod session;
pub mod system;
pub mod upstream;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorState, EventKind, ShareEvent, ShareNotification, ShareStatus};
pub use downstream::{DownstreamPhase, DownstreamStateMachine, InterfaceStatus};
pub use error::{NetShareError, Result, ShareErrorType};
pub use service::{AllowList, Capability, NetShareService, PermissionCheck};
pub use upstream::{
    UpstreamCapabilities, UpstreamChange, UpstreamCommand, UpstreamInfo, UpstreamKind, UpstreamMonitor,
    UpstreamObserver,
};
