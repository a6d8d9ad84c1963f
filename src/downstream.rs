//! Downstream interface state machines and the binding table that owns them.
//!
//! Each managed interface gets one [`DownstreamStateMachine`]. It brings the
//! interface up and down and holds the interface's single forwarding pair.
//! Instances never share state with each other; the coordinator drives them
//! one at a time under its own lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{with_timeout, NetShareError, Result};
use crate::system::{ForwardingControl, InterfaceControl};

/// Whether a downstream interface is currently usable for sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceStatus {
    Active,
    Inactive,
}

/// Lifecycle phase of one downstream interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamPhase {
    /// Never activated, or brought down again.
    Idle,
    /// Up, no forwarding pair.
    Active,
    /// Up and forwarding through `upstream`.
    Shared { upstream: String },
    /// The last activation did not leave the interface up.
    Unavailable,
}

pub struct DownstreamStateMachine {
    name: String,
    control: Arc<dyn InterfaceControl>,
    forwarding: Arc<dyn ForwardingControl>,
    op_timeout: Duration,
    retries: u32,
    phase: Mutex<DownstreamPhase>,
}

impl std::fmt::Debug for DownstreamStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamStateMachine")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .finish()
    }
}

impl DownstreamStateMachine {
    pub fn new(
        name: impl Into<String>,
        control: Arc<dyn InterfaceControl>,
        forwarding: Arc<dyn ForwardingControl>,
        op_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            control,
            forwarding,
            op_timeout,
            retries,
            phase: Mutex::new(DownstreamPhase::Idle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_phase(&self) -> MutexGuard<'_, DownstreamPhase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> DownstreamPhase {
        self.lock_phase().clone()
    }

    fn set_phase(&self, phase: DownstreamPhase) {
        debug!(iface = %self.name, ?phase, "downstream phase");
        *self.lock_phase() = phase;
    }

    pub fn status(&self) -> InterfaceStatus {
        match *self.lock_phase() {
            DownstreamPhase::Active | DownstreamPhase::Shared { .. } => InterfaceStatus::Active,
            DownstreamPhase::Idle | DownstreamPhase::Unavailable => InterfaceStatus::Inactive,
        }
    }

    /// Upstream this interface currently forwards through.
    pub fn upstream(&self) -> Option<String> {
        match &*self.lock_phase() {
            DownstreamPhase::Shared { upstream } => Some(upstream.clone()),
            _ => None,
        }
    }

    /// Whether the interface exists on the system.
    pub async fn is_available(&self) -> Result<bool> {
        let operation = format!("read config of {}", self.name);
        match with_timeout(self.op_timeout, operation, self.control.get_interface_config(&self.name)).await {
            Ok(_) => Ok(true),
            Err(e @ NetShareError::Timeout { .. }) => Err(e),
            Err(e) => {
                debug!(iface = %self.name, "interface not available: {}", e);
                Ok(false)
            }
        }
    }

    /// Bring the interface up and report whether it ended up active.
    ///
    /// Failures of the up primitive are retried; a timeout is returned at once.
    pub async fn activate(&self) -> Result<InterfaceStatus> {
        if self.status() == InterfaceStatus::Active {
            return Ok(InterfaceStatus::Active);
        }

        let mut last_error = None;
        for attempt in 0..=self.retries {
            let operation = format!("bring {} up", self.name);
            match with_timeout(self.op_timeout, operation, self.control.set_interface_up(&self.name)).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e @ NetShareError::Timeout { .. }) => {
                    self.set_phase(DownstreamPhase::Unavailable);
                    return Err(e);
                }
                Err(e) => {
                    warn!(iface = %self.name, attempt, "failed to bring interface up: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            self.set_phase(DownstreamPhase::Unavailable);
            return Err(e);
        }

        let operation = format!("read config of {}", self.name);
        let config = match with_timeout(self.op_timeout, operation, self.control.get_interface_config(&self.name)).await {
            Ok(config) => config,
            Err(e) => {
                self.set_phase(DownstreamPhase::Unavailable);
                return Err(e);
            }
        };

        if config.is_up {
            info!(iface = %self.name, address = ?config.ipv4_address, "downstream active");
            self.set_phase(DownstreamPhase::Active);
            Ok(InterfaceStatus::Active)
        } else {
            info!(iface = %self.name, "downstream did not come up");
            self.set_phase(DownstreamPhase::Unavailable);
            Ok(InterfaceStatus::Inactive)
        }
    }

    /// Release the forwarding pair, bring the interface down and confirm it
    /// is down. A no-op for an interface that was never activated.
    pub async fn deactivate(&self) -> Result<()> {
        if self.phase() == DownstreamPhase::Idle {
            return Ok(());
        }

        self.unbind_upstream().await?;

        for attempt in 0..=self.retries {
            let operation = format!("bring {} down", self.name);
            match with_timeout(self.op_timeout, operation, self.control.set_interface_down(&self.name)).await {
                Ok(()) => break,
                Err(e @ NetShareError::Timeout { .. }) => return Err(e),
                Err(e) => warn!(iface = %self.name, attempt, "failed to bring interface down: {}", e),
            }
        }

        self.confirm_down().await?;
        info!(iface = %self.name, "downstream inactive");
        self.set_phase(DownstreamPhase::Idle);
        Ok(())
    }

    async fn confirm_down(&self) -> Result<()> {
        let operation = format!("read config of {}", self.name);
        match with_timeout(self.op_timeout, operation, self.control.get_interface_config(&self.name)).await {
            Ok(config) if config.is_up => Err(NetShareError::InterfaceStillUp(self.name.clone())),
            Ok(_) => Ok(()),
            Err(e @ NetShareError::Timeout { .. }) => Err(e),
            Err(e) => {
                // An interface that disappeared is as down as it gets.
                debug!(iface = %self.name, "interface gone: {}", e);
                Ok(())
            }
        }
    }

    /// Apply the forwarding pair (self, upstream). Moving to another upstream
    /// removes the previous pair first. Does nothing unless the interface is up.
    pub async fn bind_upstream(&self, upstream: &str) -> Result<()> {
        match self.phase() {
            DownstreamPhase::Shared { upstream: current } if current == upstream => return Ok(()),
            DownstreamPhase::Shared { .. } => self.unbind_upstream().await?,
            DownstreamPhase::Active => {}
            DownstreamPhase::Idle | DownstreamPhase::Unavailable => {
                debug!(iface = %self.name, upstream, "not binding inactive downstream");
                return Ok(());
            }
        }

        let operation = format!("apply forwarding {} -> {}", self.name, upstream);
        with_timeout(self.op_timeout, operation, self.forwarding.apply(&self.name, upstream)).await?;
        self.set_phase(DownstreamPhase::Shared {
            upstream: upstream.to_string(),
        });
        Ok(())
    }

    /// Remove the forwarding pair if one is held. On failure the pair is kept
    /// so a later call can retry.
    pub async fn unbind_upstream(&self) -> Result<()> {
        let Some(upstream) = self.upstream() else {
            return Ok(());
        };

        let operation = format!("remove forwarding {} -> {}", self.name, upstream);
        with_timeout(self.op_timeout, operation, self.forwarding.remove(&self.name, &upstream)).await?;
        self.set_phase(DownstreamPhase::Active);
        Ok(())
    }
}

/// Coordinator-side record of one managed downstream interface.
#[derive(Debug, Clone)]
pub struct DownstreamBinding {
    pub name: String,
    /// Status as last reported to the coordinator.
    pub status: InterfaceStatus,
    pub machine: Arc<DownstreamStateMachine>,
}

/// All managed downstream interfaces, at most one binding per name.
#[derive(Debug, Default)]
pub struct DownstreamSet {
    bindings: BTreeMap<String, DownstreamBinding>,
}

impl DownstreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, machine: Arc<DownstreamStateMachine>) -> Result<()> {
        let name = machine.name().to_string();
        if self.bindings.contains_key(&name) {
            return Err(NetShareError::DuplicateInterface(name));
        }

        self.bindings.insert(
            name.clone(),
            DownstreamBinding {
                name,
                status: InterfaceStatus::Inactive,
                machine,
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<DownstreamBinding> {
        self.bindings
            .remove(name)
            .ok_or_else(|| NetShareError::UnknownInterface(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&DownstreamBinding> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Whether `machine` is the live handle for its interface name.
    pub fn is_current(&self, machine: &Arc<DownstreamStateMachine>) -> bool {
        self.bindings
            .get(machine.name())
            .is_some_and(|b| Arc::ptr_eq(&b.machine, machine))
    }

    /// Record a reported status. Returns whether it changed.
    pub fn set_status(&mut self, name: &str, status: InterfaceStatus) -> bool {
        match self.bindings.get_mut(name) {
            Some(binding) if binding.status != status => {
                binding.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.bindings
            .values()
            .filter(|b| b.status == InterfaceStatus::Active)
            .count()
    }

    pub fn active_names(&self) -> Vec<String> {
        self.bindings
            .values()
            .filter(|b| b.status == InterfaceStatus::Active)
            .map(|b| b.name.clone())
            .collect()
    }

    pub fn active_machines(&self) -> Vec<Arc<DownstreamStateMachine>> {
        self.bindings
            .values()
            .filter(|b| b.status == InterfaceStatus::Active)
            .map(|b| b.machine.clone())
            .collect()
    }

    pub fn machines(&self) -> Vec<Arc<DownstreamStateMachine>> {
        self.bindings.values().map(|b| b.machine.clone()).collect()
    }
}
