//! Default-route probe feeding the upstream monitor.
//!
//! Periodically reads the default routes and reports interfaces that gained
//! or lost one. Repeated probe failures are reported as a monitor fault.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::command;
use crate::config::Config;
use crate::upstream::{UpstreamCapabilities, UpstreamInfo, UpstreamKind, UpstreamMonitor};

/// Consecutive failed probes before the monitor reports a fault.
const MAX_PROBE_FAILURES: u32 = 3;

/// Counts consecutive failed polls. Every run of `MAX_PROBE_FAILURES`
/// failures is reported once, then counting starts over.
#[derive(Debug, Default)]
struct FailureStreak {
    failures: u32,
}

impl FailureStreak {
    fn success(&mut self) {
        self.failures = 0;
    }

    /// Record a failure; true when it completes a streak worth reporting.
    fn failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= MAX_PROBE_FAILURES {
            self.failures = 0;
            return true;
        }
        false
    }
}

/// Polls `ip route` and keeps the monitor's candidates in sync.
pub struct UpstreamProbe {
    monitor: Arc<UpstreamMonitor>,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
}

impl UpstreamProbe {
    pub fn new(monitor: Arc<UpstreamMonitor>, config: Config) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            monitor,
            config,
            shutdown_tx,
        }
    }

    /// Spawn the polling task.
    pub fn start(&self) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.probe_interval());
            let mut streak = FailureStreak::default();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match command::run("ip", &["-o", "route", "show", "default"]).await {
                            Ok(output) => {
                                streak.success();
                                sync_candidates(&monitor, &parse_default_routes(&output), &config);
                            }
                            Err(e) => {
                                warn!("default route probe failed: {}", e);
                                if streak.failure() {
                                    monitor.report_fault(&format!("default route probe failed: {}", e));
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("upstream probe stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signal the polling task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Interfaces carrying a default route, in first-seen order.
///
/// Format: `default via 192.168.1.1 dev wlan0 proto dhcp metric 600`
fn parse_default_routes(output: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            parts.find(|p| *p == "dev")?;
            parts.next().map(str::to_string)
        })
        .filter(|iface| seen.insert(iface.clone()))
        .collect()
}

/// Guess the network kind from the interface name.
pub fn classify_interface(name: &str) -> UpstreamKind {
    const PREFIXES: &[(&str, UpstreamKind)] = &[
        ("rmnet", UpstreamKind::Cellular),
        ("wwan", UpstreamKind::Cellular),
        ("ccmni", UpstreamKind::Cellular),
        ("wlan", UpstreamKind::WifiClient),
        ("wl", UpstreamKind::WifiClient),
        ("eth", UpstreamKind::Ethernet),
        ("en", UpstreamKind::Ethernet),
        ("bnep", UpstreamKind::Bluetooth),
        ("tun", UpstreamKind::Vpn),
        ("wg", UpstreamKind::Vpn),
        ("ppp", UpstreamKind::Vpn),
    ];

    PREFIXES
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, kind)| *kind)
        .unwrap_or(UpstreamKind::Other)
}

/// Bring the monitor's candidates in line with the probed routes.
fn sync_candidates(monitor: &UpstreamMonitor, routed: &[String], config: &Config) {
    let known: Vec<String> = monitor.candidates().into_iter().map(|c| c.iface).collect();

    for iface in known.iter().filter(|k| !routed.contains(k)) {
        monitor.remove_network(iface);
    }

    for iface in routed.iter().filter(|r| !known.contains(r)) {
        let capabilities = if config.is_metered(iface) {
            UpstreamCapabilities::metered()
        } else {
            UpstreamCapabilities::unmetered()
        };
        monitor.add_network(UpstreamInfo::new(
            iface.clone(),
            classify_interface(iface),
            capabilities,
        ));
    }
}
