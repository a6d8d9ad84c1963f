//! netshare - share the current upstream connection to downstream interfaces.
//!
//! Usage: sudo netshare <downstream-iface>...

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netshare::system::{IpLink, NatForwarding, UpstreamProbe};
use netshare::service::log_notifications;
use netshare::{AllowList, Config, Coordinator, NetShareService, UpstreamMonitor};

const REQUESTER: &str = "cli";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("netshare=info")),
        )
        .init();

    if !is_root() {
        eprintln!("Error: This program must be run as root (sudo).");
        eprintln!("Usage: sudo netshare <downstream-iface>...");
        std::process::exit(1);
    }

    let interfaces: Vec<String> = std::env::args().skip(1).collect();
    if interfaces.is_empty() {
        bail!("no downstream interface given");
    }

    let config = Config::load();
    config.save_if_missing();
    info!(?interfaces, "starting netshare");

    let monitor = Arc::new(UpstreamMonitor::new());
    let coordinator = Arc::new(Coordinator::new(
        monitor.clone(),
        Arc::new(IpLink::new()),
        Arc::new(NatForwarding::new()),
        config.clone(),
    ));
    let service = NetShareService::new(
        coordinator.clone(),
        Arc::new(AllowList::new(config.allowed_requesters.clone())),
    );

    let notifier = tokio::spawn(log_notifications(service.subscribe()));

    let pump = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    let probe = UpstreamProbe::new(monitor, config);
    let probe_task = probe.start();

    let result = service
        .enable(REQUESTER, &interfaces)
        .await
        .context("Failed to start sharing");

    if result.is_ok() {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("stopping");
        if let Err(e) = service.disable(REQUESTER).await {
            error!("failed to stop sharing cleanly: {}", e);
        }
    }

    probe.shutdown();
    let _ = probe_task.await;
    coordinator.shutdown().await;
    pump.abort();
    notifier.abort();

    result
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
