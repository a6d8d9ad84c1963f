//! Transition handlers. Each returns a [`HandlerResult`]; none of them
//! switches state or dispatches directly.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::event::{HandlerResult, ShareEvent, ShareNotification};
use super::select::select_upstream;
use super::table::Handler;
use super::CoordinatorCore;
use crate::downstream::{DownstreamPhase, DownstreamStateMachine, InterfaceStatus};
use crate::error::{NetShareError, ShareErrorType};

impl CoordinatorCore {
    pub(super) async fn invoke(&mut self, handler: Handler, event: ShareEvent) -> HandlerResult {
        use ShareEvent::*;

        match (handler, event) {
            (Handler::InitEnable, EnableRequest { requester, interfaces }) => {
                self.init_enable(requester, &interfaces).await
            }
            (Handler::InitDisable, DisableRequest { requester }) => self.init_disable(&requester).await,
            (Handler::InitInterfaceActive, InterfaceActiveChanged { downstream, .. }) => {
                self.init_interface_active(&downstream).await
            }
            (Handler::InitInterfaceInactive, InterfaceActiveChanged { downstream, .. }) => {
                self.record_inactive(&downstream)
            }
            (Handler::AliveEnable, EnableRequest { requester, interfaces }) => {
                self.alive_enable(&requester, &interfaces).await
            }
            (Handler::AliveDisable, DisableRequest { requester }) => self.alive_disable(&requester).await,
            (Handler::AliveInterfaceActive, InterfaceActiveChanged { downstream, .. }) => {
                self.alive_interface_active(&downstream).await
            }
            (Handler::AliveInterfaceInactive, InterfaceActiveChanged { downstream, .. }) => {
                self.alive_interface_inactive(&downstream).await
            }
            (Handler::AliveUpstreamChanged, UpstreamInfoChanged(change)) => {
                debug!(command = ?change.command, iface = %change.info.iface, "upstream changed");
                self.choose_upstream_type().await
            }
            (Handler::AliveUpstreamChanged, UpstreamRecheck) => self.choose_upstream_type().await,
            (Handler::AliveUpstreamFault, UpstreamFault { reason }) => {
                warn!(%reason, "upstream monitor fault");
                HandlerResult::Fatal(ShareErrorType::UpstreamFault)
            }
            (Handler::AliveSessionIdle, SessionIdle) => self.alive_session_idle().await,
            (Handler::ErrorEnable, EnableRequest { .. }) => {
                HandlerResult::Rejected(NetShareError::InErrorState {
                    error: self.error_type.unwrap_or(ShareErrorType::Unspecified),
                })
            }
            (Handler::ErrorInterfaceActive, InterfaceActiveChanged { downstream, .. }) => {
                self.error_interface_active(&downstream).await
            }
            (Handler::ErrorInterfaceInactive, InterfaceActiveChanged { downstream, .. }) => {
                self.record_inactive(&downstream)
            }
            (Handler::ErrorClear, ErrorClear) => self.error_clear().await,
            (handler, event) => {
                warn!(?handler, kind = ?event.kind(), "handler does not accept event");
                HandlerResult::Defer
            }
        }
    }

    async fn init_enable(&mut self, requester: String, interfaces: &[String]) -> HandlerResult {
        if let Some(pending) = &self.session.requester {
            if *pending != requester {
                return HandlerResult::Rejected(NetShareError::AlreadySharing {
                    requester: pending.clone(),
                });
            }
        }

        let mut available = Vec::new();
        for name in interfaces {
            let Some(binding) = self.downstreams.get(name) else {
                continue;
            };
            let machine = binding.machine.clone();
            match machine.is_available().await {
                Ok(true) => available.push(machine),
                Ok(false) => info!(iface = %name, "downstream not available"),
                Err(e) => return HandlerResult::Fatal(e.systemic_type(ShareErrorType::Timeout)),
            }
        }
        if available.is_empty() {
            return HandlerResult::Rejected(NetShareError::NoDownstreamInterface);
        }

        info!(%requester, interfaces = available.len(), "enabling sharing");
        self.session.requester = Some(requester);
        self.session
            .interfaces
            .extend(available.iter().map(|m| m.name().to_string()));

        let mut any_active = false;
        let mut failed = Vec::new();
        for machine in &available {
            match self.activate_downstream(machine).await {
                Ok(InterfaceStatus::Active) => any_active = true,
                Ok(InterfaceStatus::Inactive) => {
                    debug!(iface = machine.name(), "downstream not up yet");
                }
                Err(e @ NetShareError::Timeout { .. }) => {
                    return HandlerResult::Fatal(e.systemic_type(ShareErrorType::Timeout));
                }
                Err(e) => {
                    warn!(iface = machine.name(), "activation failed: {}", e);
                    failed.push(machine.name().to_string());
                }
            }
        }

        if any_active {
            HandlerResult::Success
        } else if failed.len() == available.len() {
            self.session.release();
            HandlerResult::Rejected(NetShareError::ActivationFailed { interfaces: failed })
        } else {
            // A later link-up notification completes the request.
            HandlerResult::Defer
        }
    }

    async fn init_disable(&mut self, requester: &str) -> HandlerResult {
        match &self.session.requester {
            None => {
                debug!(%requester, "disable while idle");
                return HandlerResult::Success;
            }
            Some(pending) if pending != requester => {
                return HandlerResult::Rejected(NetShareError::RequesterMismatch {
                    requester: requester.to_string(),
                });
            }
            Some(_) => {}
        }

        info!(%requester, "cancelling pending request");
        self.session.release();
        match self.deactivate_all().await {
            Ok(()) => HandlerResult::Success,
            Err(e) => HandlerResult::Fatal(e.systemic_type(ShareErrorType::InterfaceControl)),
        }
    }

    async fn init_interface_active(&mut self, machine: &Arc<DownstreamStateMachine>) -> HandlerResult {
        if !self.downstreams.is_current(machine) || !self.session.wants(machine.name()) {
            return HandlerResult::Defer;
        }

        match self.ensure_machine_active(machine).await {
            Ok(true) => {
                self.downstreams.set_status(machine.name(), InterfaceStatus::Active);
                HandlerResult::Success
            }
            Ok(false) => HandlerResult::Defer,
            Err(result) => result,
        }
    }

    fn record_inactive(&mut self, machine: &Arc<DownstreamStateMachine>) -> HandlerResult {
        if self.downstreams.is_current(machine) {
            self.downstreams.set_status(machine.name(), InterfaceStatus::Inactive);
        }
        HandlerResult::Success
    }

    async fn alive_enable(&mut self, requester: &str, interfaces: &[String]) -> HandlerResult {
        if !self.session.is_requested_by(requester) {
            return HandlerResult::Rejected(NetShareError::AlreadySharing {
                requester: self.session.requester.clone().unwrap_or_default(),
            });
        }

        let mut pending = Vec::new();
        for name in interfaces {
            if let Some(binding) = self.downstreams.get(name) {
                self.session.interfaces.insert(name.clone());
                if binding.status == InterfaceStatus::Inactive {
                    pending.push(binding.machine.clone());
                }
            }
        }

        for machine in &pending {
            match self.activate_downstream(machine).await {
                Ok(_) => {}
                Err(e @ NetShareError::Timeout { .. }) => {
                    return HandlerResult::Fatal(e.systemic_type(ShareErrorType::Timeout));
                }
                Err(e) => warn!(iface = machine.name(), "activation failed: {}", e),
            }
        }
        HandlerResult::Success
    }

    async fn alive_disable(&mut self, requester: &str) -> HandlerResult {
        if !self.session.is_requested_by(requester) {
            return HandlerResult::Rejected(NetShareError::RequesterMismatch {
                requester: requester.to_string(),
            });
        }

        info!(%requester, "disabling sharing");
        if let Err(e) = self.turn_off_main_share_settings().await {
            return HandlerResult::Fatal(e.systemic_type(ShareErrorType::ForwardingFailed));
        }
        for machine in self.downstreams.machines() {
            if let Err(e) = self.deactivate_downstream(&machine).await {
                warn!(iface = machine.name(), "failed to deactivate: {}", e);
                return HandlerResult::Fatal(e.systemic_type(ShareErrorType::InterfaceControl));
            }
        }
        HandlerResult::Success
    }

    async fn alive_interface_active(&mut self, machine: &Arc<DownstreamStateMachine>) -> HandlerResult {
        if !self.downstreams.is_current(machine) {
            return HandlerResult::Defer;
        }
        if !self.session.wants(machine.name()) {
            debug!(iface = machine.name(), "link up on a downstream outside the session");
            return HandlerResult::Defer;
        }

        match self.ensure_machine_active(machine).await {
            Ok(true) => {}
            Ok(false) => return HandlerResult::Defer,
            Err(result) => return result,
        }
        self.downstreams.set_status(machine.name(), InterfaceStatus::Active);

        if !self.session.has_set_forward() {
            return self.choose_upstream_type().await;
        }

        let Some(upstream) = self.session.upstream_iface().map(str::to_string) else {
            return HandlerResult::Success;
        };
        match machine.bind_upstream(&upstream).await {
            Ok(()) => {
                info!(iface = machine.name(), %upstream, "downstream joined forwarding");
                HandlerResult::Success
            }
            Err(e) => HandlerResult::Fatal(e.systemic_type(ShareErrorType::ForwardingFailed)),
        }
    }

    async fn alive_interface_inactive(&mut self, machine: &Arc<DownstreamStateMachine>) -> HandlerResult {
        if !self.downstreams.is_current(machine) {
            return HandlerResult::Defer;
        }

        if let Err(e) = machine.deactivate().await {
            return HandlerResult::Fatal(e.systemic_type(ShareErrorType::InterfaceControl));
        }

        let changed = self.downstreams.set_status(machine.name(), InterfaceStatus::Inactive);
        if changed && self.downstreams.active_count() == 0 {
            debug!("last downstream gone");
            self.pending.push_back(ShareEvent::SessionIdle);
        }
        HandlerResult::Success
    }

    async fn alive_session_idle(&mut self) -> HandlerResult {
        if self.downstreams.active_count() > 0 {
            return HandlerResult::Defer;
        }
        match self.turn_off_main_share_settings().await {
            Ok(()) => HandlerResult::Success,
            Err(e) => HandlerResult::Fatal(e.systemic_type(ShareErrorType::ForwardingFailed)),
        }
    }

    async fn error_interface_active(&mut self, machine: &Arc<DownstreamStateMachine>) -> HandlerResult {
        if !self.downstreams.is_current(machine) {
            return HandlerResult::Success;
        }

        warn!(iface = machine.name(), "downstream came up while in error, bringing it down");
        if let Err(e) = machine.deactivate().await {
            return HandlerResult::Fatal(e.systemic_type(ShareErrorType::InterfaceControl));
        }
        self.downstreams.set_status(machine.name(), InterfaceStatus::Inactive);
        HandlerResult::Success
    }

    /// Verify teardown is complete, retrying whatever is left.
    async fn error_clear(&mut self) -> HandlerResult {
        let mut complete = true;

        if let Err(e) = self.turn_off_main_share_settings().await {
            warn!("forwarding still applied: {}", e);
            complete = false;
        }
        for machine in self.downstreams.machines() {
            if machine.phase() == DownstreamPhase::Idle {
                self.downstreams.set_status(machine.name(), InterfaceStatus::Inactive);
                continue;
            }
            match machine.deactivate().await {
                Ok(()) => {
                    self.downstreams.set_status(machine.name(), InterfaceStatus::Inactive);
                }
                Err(e) => {
                    warn!(iface = machine.name(), "downstream still up: {}", e);
                    complete = false;
                }
            }
        }
        self.unsubscribe_monitor();

        if complete {
            HandlerResult::Success
        } else {
            HandlerResult::Defer
        }
    }

    /// Re-evaluate the upstream and move forwarding to it when it changed.
    async fn choose_upstream_type(&mut self) -> HandlerResult {
        let chosen = select_upstream(&self.monitor.candidates(), &self.config);
        let current = self.session.upstream_iface().map(str::to_string);

        let Some(info) = chosen else {
            if let Err(e) = self.turn_off_main_share_settings().await {
                return HandlerResult::Fatal(e.systemic_type(ShareErrorType::ForwardingFailed));
            }
            self.session.upstream = None;
            if current.is_some() {
                info!("no usable upstream, waiting");
                self.notify(ShareNotification::UpstreamChanged { upstream: None });
            }
            return HandlerResult::Success;
        };

        let changed = current.as_deref() != Some(info.iface.as_str());
        if !changed && self.session.has_set_forward() {
            self.session.upstream = Some(info);
            return HandlerResult::Success;
        }

        if changed {
            if let Err(e) = self.turn_off_main_share_settings().await {
                return HandlerResult::Fatal(e.systemic_type(ShareErrorType::ForwardingFailed));
            }
            info!(upstream = %info.iface, kind = %info.kind, "upstream selected");
        }
        let iface = info.iface.clone();
        self.session.upstream = Some(info);

        if let Err(e) = self.turn_on_main_share_settings().await {
            return HandlerResult::Fatal(e.systemic_type(ShareErrorType::ForwardingFailed));
        }
        if changed {
            self.notify(ShareNotification::UpstreamChanged { upstream: Some(iface) });
        }
        HandlerResult::Success
    }

    /// Make sure the machine reports up. `Ok(false)` means not up yet;
    /// `Err` carries the handler result for a systemic failure.
    async fn ensure_machine_active(
        &self,
        machine: &Arc<DownstreamStateMachine>,
    ) -> Result<bool, HandlerResult> {
        match machine.activate().await {
            Ok(status) => Ok(status == InterfaceStatus::Active),
            Err(e @ NetShareError::Timeout { .. }) => {
                Err(HandlerResult::Fatal(e.systemic_type(ShareErrorType::Timeout)))
            }
            Err(e) => {
                warn!(iface = machine.name(), "activation failed: {}", e);
                Ok(false)
            }
        }
    }
}
