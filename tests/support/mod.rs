//! Shared fakes for coordinator integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use netshare::system::{ForwardingControl, InterfaceConfig, InterfaceControl};
use netshare::{
    Config, Coordinator, NetShareError, Result, ShareNotification, UpstreamCapabilities, UpstreamInfo,
    UpstreamKind, UpstreamMonitor,
};

fn command_failed(command: &str, message: &str) -> NetShareError {
    NetShareError::CommandFailed {
        command: command.to_string(),
        message: message.to_string(),
    }
}

/// In-memory link layer with failure injection.
#[derive(Default)]
pub struct MockLink {
    up: Mutex<HashMap<String, bool>>,
    missing: Mutex<HashSet<String>>,
    fail_up: Mutex<HashSet<String>>,
    stuck_up: Mutex<HashSet<String>>,
    hang: AtomicBool,
}

impl MockLink {
    pub fn is_up(&self, name: &str) -> bool {
        self.up.lock().unwrap().get(name).copied().unwrap_or(false)
    }

    pub fn any_up(&self) -> bool {
        self.up.lock().unwrap().values().any(|up| *up)
    }

    pub fn set_missing(&self, name: &str) {
        self.missing.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_up(&self, name: &str) {
        self.fail_up.lock().unwrap().insert(name.to_string());
    }

    pub fn stick_up(&self, name: &str, stuck: bool) {
        let mut stuck_up = self.stuck_up.lock().unwrap();
        if stuck {
            stuck_up.insert(name.to_string());
        } else {
            stuck_up.remove(name);
        }
    }

    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl InterfaceControl for MockLink {
    async fn set_interface_up(&self, name: &str) -> Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.missing.lock().unwrap().contains(name) {
            return Err(command_failed("ip link set up", "Cannot find device"));
        }
        if self.fail_up.lock().unwrap().contains(name) {
            return Err(command_failed("ip link set up", "Operation not supported"));
        }
        self.up.lock().unwrap().insert(name.to_string(), true);
        Ok(())
    }

    async fn set_interface_down(&self, name: &str) -> Result<()> {
        if !self.stuck_up.lock().unwrap().contains(name) {
            self.up.lock().unwrap().insert(name.to_string(), false);
        }
        Ok(())
    }

    async fn get_interface_config(&self, name: &str) -> Result<InterfaceConfig> {
        if self.missing.lock().unwrap().contains(name) {
            return Err(command_failed("ip link show", "Cannot find device"));
        }
        Ok(InterfaceConfig {
            name: name.to_string(),
            ipv4_address: None,
            prefix_len: None,
            is_up: self.is_up(name),
        })
    }
}

/// Records applied forwarding pairs.
#[derive(Default)]
pub struct MockForwarding {
    pairs: Mutex<HashSet<(String, String)>>,
    fail_apply: AtomicBool,
    fail_remove: AtomicBool,
    applies: AtomicUsize,
}

impl MockForwarding {
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self.pairs.lock().unwrap().iter().cloned().collect();
        pairs.sort();
        pairs
    }

    pub fn has_pair(&self, downstream: &str, upstream: &str) -> bool {
        self.pairs
            .lock()
            .unwrap()
            .contains(&(downstream.to_string(), upstream.to_string()))
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ForwardingControl for MockForwarding {
    async fn apply(&self, downstream: &str, upstream: &str) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(command_failed("iptables -A FORWARD", "table locked"));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.pairs
            .lock()
            .unwrap()
            .insert((downstream.to_string(), upstream.to_string()));
        Ok(())
    }

    async fn remove(&self, downstream: &str, upstream: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(command_failed("iptables -D FORWARD", "table locked"));
        }
        self.pairs
            .lock()
            .unwrap()
            .remove(&(downstream.to_string(), upstream.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub monitor: Arc<UpstreamMonitor>,
    pub link: Arc<MockLink>,
    pub forwarding: Arc<MockForwarding>,
}

/// Errors stay put until cleared explicitly.
pub fn test_config() -> Config {
    Config {
        auto_clear_errors: false,
        operation_timeout_ms: 200,
        activation_retries: 1,
        ..Config::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: Config) -> Harness {
    let monitor = Arc::new(UpstreamMonitor::new());
    let link = Arc::new(MockLink::default());
    let forwarding = Arc::new(MockForwarding::default());
    let coordinator = Arc::new(Coordinator::new(
        monitor.clone(),
        link.clone(),
        forwarding.clone(),
        config,
    ));

    Harness {
        coordinator,
        monitor,
        link,
        forwarding,
    }
}

impl Harness {
    /// Deliver everything the monitor queued.
    pub async fn settle(&self) {
        while self.coordinator.pump_pending().await > 0 {}
    }
}

pub fn names(ifaces: &[&str]) -> Vec<String> {
    ifaces.iter().map(|s| s.to_string()).collect()
}

pub fn cellular(iface: &str) -> UpstreamInfo {
    UpstreamInfo::new(iface, UpstreamKind::Cellular, UpstreamCapabilities::metered())
}

pub fn wifi(iface: &str) -> UpstreamInfo {
    UpstreamInfo::new(iface, UpstreamKind::WifiClient, UpstreamCapabilities::unmetered())
}

pub fn drain(rx: &mut broadcast::Receiver<ShareNotification>) -> Vec<ShareNotification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}
