//! Upstream network monitor.
//!
//! Tracks the candidate upstream networks and reports every change to a single
//! subscriber. The monitor only reports facts: which candidate becomes *the*
//! upstream is decided by the coordinator.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Kind of network an upstream interface connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamKind {
    Cellular,
    WifiClient,
    Ethernet,
    Bluetooth,
    Vpn,
    Other,
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamKind::Cellular => f.write_str("cellular"),
            UpstreamKind::WifiClient => f.write_str("wifi"),
            UpstreamKind::Ethernet => f.write_str("ethernet"),
            UpstreamKind::Bluetooth => f.write_str("bluetooth"),
            UpstreamKind::Vpn => f.write_str("vpn"),
            UpstreamKind::Other => f.write_str("other"),
        }
    }
}

/// Reachability and policy summary of an upstream network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpstreamCapabilities {
    /// The network claims internet access.
    pub internet: bool,
    /// Internet access has been confirmed.
    pub validated: bool,
    /// Traffic on this network is billed by volume.
    pub metered: bool,
}

impl UpstreamCapabilities {
    /// Validated internet access on an unmetered network.
    pub fn unmetered() -> Self {
        Self {
            internet: true,
            validated: true,
            metered: false,
        }
    }

    /// Validated internet access on a metered network.
    pub fn metered() -> Self {
        Self {
            metered: true,
            ..Self::unmetered()
        }
    }
}

/// Snapshot of one candidate upstream network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamInfo {
    /// Interface carrying the network; also its identity.
    pub iface: String,
    pub kind: UpstreamKind,
    pub capabilities: UpstreamCapabilities,
    /// Monotonic insertion order assigned by the monitor.
    pub sequence: u64,
}

impl UpstreamInfo {
    pub fn new(iface: impl Into<String>, kind: UpstreamKind, capabilities: UpstreamCapabilities) -> Self {
        Self {
            iface: iface.into(),
            kind,
            capabilities,
            sequence: 0,
        }
    }
}

/// What happened to the network carried by an [`UpstreamChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamCommand {
    Added,
    Removed,
    CapabilitiesChanged,
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamChange {
    pub command: UpstreamCommand,
    pub info: UpstreamInfo,
}

/// Receiver of monitor notifications.
///
/// Callbacks run while the monitor's lock is held so that nothing is delivered
/// after [`UpstreamMonitor::unsubscribe`] returns. Implementations must not
/// block or call back into the monitor.
pub trait UpstreamObserver: Send + Sync {
    fn on_upstream_changed(&self, change: UpstreamChange);

    fn on_monitor_fault(&self, reason: &str);
}

#[derive(Default)]
struct MonitorState {
    candidates: Vec<UpstreamInfo>,
    next_sequence: u64,
    subscriber: Option<Arc<dyn UpstreamObserver>>,
}

impl MonitorState {
    fn notify(&self, command: UpstreamCommand, info: &UpstreamInfo) {
        if let Some(subscriber) = &self.subscriber {
            subscriber.on_upstream_changed(UpstreamChange {
                command,
                info: info.clone(),
            });
        }
    }
}

/// Watches the set of available upstream networks.
#[derive(Default)]
pub struct UpstreamMonitor {
    state: Mutex<MonitorState>,
}

impl UpstreamMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        // Nothing in MonitorState can be left half-updated by a panic.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe `observer`. Returns `false` if a subscriber is already present,
    /// in which case the existing one is kept.
    pub fn subscribe(&self, observer: Arc<dyn UpstreamObserver>) -> bool {
        let mut state = self.lock();
        if state.subscriber.is_some() {
            debug!("upstream monitor already subscribed");
            return false;
        }
        state.subscriber = Some(observer);
        debug!("upstream monitor subscribed");
        true
    }

    /// Drop the subscriber. Returns `false` if there was none.
    pub fn unsubscribe(&self) -> bool {
        let removed = self.lock().subscriber.take().is_some();
        if removed {
            debug!("upstream monitor unsubscribed");
        }
        removed
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().subscriber.is_some()
    }

    /// Snapshot of all known candidates, in insertion order.
    pub fn candidates(&self) -> Vec<UpstreamInfo> {
        self.lock().candidates.clone()
    }

    /// Record a new network. A network already known by interface name is
    /// treated as a capability update.
    pub fn add_network(&self, mut info: UpstreamInfo) {
        let mut state = self.lock();
        if state.candidates.iter().any(|c| c.iface == info.iface) {
            drop(state);
            self.update_capabilities(&info.iface, info.capabilities);
            return;
        }

        state.next_sequence += 1;
        info.sequence = state.next_sequence;
        info!(iface = %info.iface, kind = %info.kind, "upstream network added");
        state.notify(UpstreamCommand::Added, &info);
        state.candidates.push(info);
    }

    /// Forget a network. Unknown names are ignored.
    pub fn remove_network(&self, iface: &str) {
        let mut state = self.lock();
        let Some(pos) = state.candidates.iter().position(|c| c.iface == iface) else {
            debug!(iface, "remove for unknown upstream ignored");
            return;
        };

        let info = state.candidates.remove(pos);
        info!(iface, "upstream network removed");
        state.notify(UpstreamCommand::Removed, &info);
    }

    /// Replace the capabilities of a known network. No notification is sent
    /// when nothing changed.
    pub fn update_capabilities(&self, iface: &str, capabilities: UpstreamCapabilities) {
        let mut state = self.lock();
        let Some(candidate) = state.candidates.iter_mut().find(|c| c.iface == iface) else {
            debug!(iface, "capability update for unknown upstream ignored");
            return;
        };
        if candidate.capabilities == capabilities {
            return;
        }

        candidate.capabilities = capabilities;
        let info = candidate.clone();
        debug!(iface, ?capabilities, "upstream capabilities changed");
        state.notify(UpstreamCommand::CapabilitiesChanged, &info);
    }

    /// Report that the monitor can no longer track upstream networks.
    pub fn report_fault(&self, reason: &str) {
        let state = self.lock();
        warn!(reason, "upstream monitor fault");
        if let Some(subscriber) = &state.subscriber {
            subscriber.on_monitor_fault(reason);
        }
    }
}
