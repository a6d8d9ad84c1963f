//! NAT and forwarding rules via iptables.
//!
//! Each (downstream, upstream) pair gets two FORWARD rules. The MASQUERADE
//! rule is per upstream and shared by all pairs using it, so it is
//! refcounted. Kernel forwarding is enabled while at least one pair exists.
//!
//! A pair is only recorded once all of its rules are in place and only
//! forgotten once all of them are gone, so a failed call can be retried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::command::{CommandRunner, SystemRunner};
use super::{ForwardingControl, IpForwarding};
use crate::error::{NetShareError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleAction {
    Append,
    Check,
    Delete,
}

impl RuleAction {
    fn flag(self) -> &'static str {
        match self {
            RuleAction::Append => "-A",
            RuleAction::Check => "-C",
            RuleAction::Delete => "-D",
        }
    }
}

fn masquerade_rule(action: RuleAction, upstream: &str) -> Vec<String> {
    [
        "-t",
        "nat",
        action.flag(),
        "POSTROUTING",
        "-o",
        upstream,
        "-j",
        "MASQUERADE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn forward_rules(action: RuleAction, downstream: &str, upstream: &str) -> [Vec<String>; 2] {
    let outbound = [
        action.flag(),
        "FORWARD",
        "-i",
        downstream,
        "-o",
        upstream,
        "-j",
        "ACCEPT",
    ];
    let inbound = [
        action.flag(),
        "FORWARD",
        "-i",
        upstream,
        "-o",
        downstream,
        "-m",
        "state",
        "--state",
        "RELATED,ESTABLISHED",
        "-j",
        "ACCEPT",
    ];
    [
        outbound.iter().map(|s| s.to_string()).collect(),
        inbound.iter().map(|s| s.to_string()).collect(),
    ]
}

#[derive(Default)]
struct NatState {
    ip_forwarding: IpForwarding,
    pairs: HashSet<(String, String)>,
    masquerade: HashMap<String, usize>,
}

/// [`ForwardingControl`] backed by iptables and the ip_forward sysctl.
pub struct NatForwarding {
    runner: Arc<dyn CommandRunner>,
    state: Mutex<NatState>,
}

impl Default for NatForwarding {
    fn default() -> Self {
        Self::new()
    }
}

impl NatForwarding {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            state: Mutex::new(NatState::default()),
        }
    }

    /// Number of applied pairs.
    pub async fn pair_count(&self) -> usize {
        self.state.lock().await.pairs.len()
    }

    async fn iptables(&self, rule: &[String]) -> Result<()> {
        let args: Vec<&str> = rule.iter().map(String::as_str).collect();
        self.runner.run("iptables", &args).await?;
        Ok(())
    }

    /// Delete a rule unless `iptables -C` says it is already gone.
    async fn delete_if_present(&self, check: &[String], delete: &[String]) -> Result<()> {
        match self.iptables(check).await {
            Ok(()) => self.iptables(delete).await,
            Err(NetShareError::CommandFailed { .. }) => {
                debug!(rule = %delete.join(" "), "rule already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Undo appended rules in reverse order. Failures are logged.
    async fn roll_back(&self, deletes: &[Vec<String>]) {
        for rule in deletes.iter().rev() {
            if let Err(e) = self.iptables(rule).await {
                warn!(rule = %rule.join(" "), error = %e, "rollback failed");
            }
        }
    }

    fn iptables_sync(&self, rule: &[String]) {
        let args: Vec<&str> = rule.iter().map(String::as_str).collect();
        self.runner.run_sync("iptables", &args);
    }
}

#[async_trait]
impl ForwardingControl for NatForwarding {
    async fn apply(&self, downstream: &str, upstream: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let key = (downstream.to_string(), upstream.to_string());
        if state.pairs.contains(&key) {
            debug!(downstream, upstream, "forwarding pair already applied");
            return Ok(());
        }

        let first_pair = state.pairs.is_empty();
        if first_pair {
            state.ip_forwarding.enable(self.runner.as_ref()).await?;
        }

        let mut steps = Vec::with_capacity(3);
        if !state.masquerade.contains_key(upstream) {
            steps.push((
                masquerade_rule(RuleAction::Append, upstream),
                masquerade_rule(RuleAction::Delete, upstream),
            ));
        }
        steps.extend(
            forward_rules(RuleAction::Append, downstream, upstream)
                .into_iter()
                .zip(forward_rules(RuleAction::Delete, downstream, upstream)),
        );

        let mut appended = Vec::with_capacity(steps.len());
        for (append, delete) in steps {
            if let Err(e) = self.iptables(&append).await {
                warn!(downstream, upstream, error = %e, "forwarding apply failed, rolling back");
                self.roll_back(&appended).await;
                if first_pair {
                    if let Err(e) = state.ip_forwarding.restore(self.runner.as_ref()).await {
                        warn!(error = %e, "failed to restore ip_forward after rollback");
                    }
                }
                return Err(e);
            }
            appended.push(delete);
        }

        *state.masquerade.entry(upstream.to_string()).or_insert(0) += 1;
        state.pairs.insert(key);
        info!(downstream, upstream, "forwarding applied");
        Ok(())
    }

    async fn remove(&self, downstream: &str, upstream: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let key = (downstream.to_string(), upstream.to_string());
        if !state.pairs.contains(&key) {
            debug!(downstream, upstream, "forwarding pair not applied");
            return Ok(());
        }

        let checks = forward_rules(RuleAction::Check, downstream, upstream);
        let deletes = forward_rules(RuleAction::Delete, downstream, upstream);
        for (check, delete) in checks.iter().zip(deletes.iter()) {
            self.delete_if_present(check, delete).await?;
        }

        let users = state.masquerade.get(upstream).copied().unwrap_or(0);
        if users <= 1 {
            self.delete_if_present(
                &masquerade_rule(RuleAction::Check, upstream),
                &masquerade_rule(RuleAction::Delete, upstream),
            )
            .await?;
        }

        if state.pairs.len() == 1 {
            state.ip_forwarding.restore(self.runner.as_ref()).await?;
        }

        if users <= 1 {
            state.masquerade.remove(upstream);
        } else {
            state.masquerade.insert(upstream.to_string(), users - 1);
        }
        state.pairs.remove(&key);
        info!(downstream, upstream, "forwarding removed");
        Ok(())
    }
}

impl Drop for NatForwarding {
    fn drop(&mut self) {
        let runner = Arc::clone(&self.runner);
        let state = self.state.get_mut();
        if state.pairs.is_empty() && !state.ip_forwarding.is_modified() {
            return;
        }

        warn!(pairs = state.pairs.len(), "removing leftover forwarding rules");
        let pairs: Vec<_> = state.pairs.drain().collect();
        let upstreams: Vec<_> = state.masquerade.drain().map(|(upstream, _)| upstream).collect();
        state.ip_forwarding.restore_sync(runner.as_ref());

        for (downstream, upstream) in pairs {
            for rule in forward_rules(RuleAction::Delete, &downstream, &upstream) {
                self.iptables_sync(&rule);
            }
        }
        for upstream in upstreams {
            self.iptables_sync(&masquerade_rule(RuleAction::Delete, &upstream));
        }
    }
}
