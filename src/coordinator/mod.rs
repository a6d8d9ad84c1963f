//! Main tethering coordinator.
//!
//! Owns the sharing state, the bound upstream and the downstream bindings.
//! Every event goes through [`Coordinator::handle_event`]: the event and the
//! current state select a row of the transition table, the row's handler
//! runs, and its result decides the next state. Handlers never call back into
//! the dispatcher; follow-up events go to an internal queue that the dispatch
//! loop drains before releasing the lock.

mod event;
mod handlers;
mod select;
mod table;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::downstream::{DownstreamPhase, DownstreamSet, DownstreamStateMachine, InterfaceStatus};
use crate::error::{NetShareError, Result, ShareErrorType};
use crate::session::SharingSession;
use crate::system::{ForwardingControl, InterfaceControl};
use crate::upstream::{UpstreamChange, UpstreamMonitor, UpstreamObserver};

pub use event::{CoordinatorState, EventKind, ShareEvent, ShareNotification, ShareStatus};
use event::HandlerResult;

/// Capacity of the notification channel; slow receivers lag, they never block.
const NOTIFICATION_CAPACITY: usize = 64;

/// Work posted by sources that must not wait for the coordinator lock.
#[derive(Debug)]
enum InboxMessage {
    /// Monitor callback, stamped with the subscription it came from.
    Monitor { generation: u64, event: ShareEvent },
    Link { iface: String, status: InterfaceStatus },
}

/// Forwards monitor callbacks into the coordinator's inbox.
struct InboxObserver {
    tx: mpsc::UnboundedSender<InboxMessage>,
    generation: u64,
}

impl InboxObserver {
    fn send(&self, event: ShareEvent) {
        let _ = self.tx.send(InboxMessage::Monitor {
            generation: self.generation,
            event,
        });
    }
}

impl UpstreamObserver for InboxObserver {
    fn on_upstream_changed(&self, change: UpstreamChange) {
        self.send(ShareEvent::UpstreamInfoChanged(change));
    }

    fn on_monitor_fault(&self, reason: &str) {
        self.send(ShareEvent::UpstreamFault {
            reason: reason.to_string(),
        });
    }
}

/// State guarded by the coordinator lock.
pub(crate) struct CoordinatorCore {
    state: CoordinatorState,
    error_type: Option<ShareErrorType>,
    session: SharingSession,
    downstreams: DownstreamSet,
    pending: VecDeque<ShareEvent>,
    monitor: Arc<UpstreamMonitor>,
    /// Bumped on every monitor subscribe and unsubscribe. Inbox messages
    /// from an older subscription are dropped.
    generation: u64,
    inbox_tx: mpsc::UnboundedSender<InboxMessage>,
    control: Arc<dyn InterfaceControl>,
    forwarding: Arc<dyn ForwardingControl>,
    config: Config,
    notifier: broadcast::Sender<ShareNotification>,
}

/// The tethering coordinator.
pub struct Coordinator {
    core: Mutex<CoordinatorCore>,
    inbox_tx: mpsc::UnboundedSender<InboxMessage>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<InboxMessage>>,
    notifier: broadcast::Sender<ShareNotification>,
}

impl Coordinator {
    pub fn new(
        monitor: Arc<UpstreamMonitor>,
        control: Arc<dyn InterfaceControl>,
        forwarding: Arc<dyn ForwardingControl>,
        config: Config,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let core = CoordinatorCore {
            state: CoordinatorState::Init,
            error_type: None,
            session: SharingSession::default(),
            downstreams: DownstreamSet::new(),
            pending: VecDeque::new(),
            monitor,
            generation: 0,
            inbox_tx: inbox_tx.clone(),
            control,
            forwarding,
            config,
            notifier: notifier.clone(),
        };

        Self {
            core: Mutex::new(core),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            notifier,
        }
    }

    /// Receive status-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ShareNotification> {
        self.notifier.subscribe()
    }

    /// Dispatch one event and everything it raises.
    pub async fn handle_event(&self, event: ShareEvent) -> Result<()> {
        let mut core = self.core.lock().await;
        core.process(event).await
    }

    /// Start sharing through `interfaces` on behalf of `requester`.
    /// Interfaces not yet registered are registered first, and forgotten
    /// again if the request is turned down.
    pub async fn enable(&self, requester: &str, interfaces: &[String]) -> Result<()> {
        let mut core = self.core.lock().await;
        let mut added = Vec::new();
        for name in interfaces {
            if !core.downstreams.contains(name) {
                if let Err(e) = core.register(name) {
                    core.discard(&added).await;
                    return Err(e);
                }
                added.push(name.clone());
            }
        }

        let result = core
            .process(ShareEvent::EnableRequest {
                requester: requester.to_string(),
                interfaces: interfaces.to_vec(),
            })
            .await;
        if let Err(e) = &result {
            if !matches!(e, NetShareError::SharingFailed { .. }) {
                core.discard(&added).await;
            }
        }
        result
    }

    /// Stop the session owned by `requester`. A no-op when nothing is shared.
    pub async fn disable(&self, requester: &str) -> Result<()> {
        self.handle_event(ShareEvent::DisableRequest {
            requester: requester.to_string(),
        })
        .await
    }

    /// Ask the coordinator to leave Error once cleanup is complete.
    pub async fn clear_error(&self) -> Result<()> {
        self.handle_event(ShareEvent::ErrorClear).await
    }

    /// Force the coordinator into Error, e.g. when the caller's permission
    /// was revoked mid-session.
    pub async fn switch_to_error_state(&self, error: ShareErrorType) {
        let mut core = self.core.lock().await;
        core.switch_to_error_state(error).await;
        core.drain().await;
    }

    /// Start managing a downstream interface.
    pub async fn register_interface(&self, name: &str) -> Result<()> {
        self.core.lock().await.register(name)
    }

    /// Stop managing a downstream interface, bringing it down first.
    pub async fn unregister_interface(&self, name: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        let result = core.unregister(name).await;
        core.drain().await;
        result
    }

    /// Report a link status change for a managed interface.
    pub async fn interface_changed(&self, name: &str, status: InterfaceStatus) -> Result<()> {
        let mut core = self.core.lock().await;
        let machine = core
            .downstreams
            .get(name)
            .map(|b| b.machine.clone())
            .ok_or_else(|| NetShareError::UnknownInterface(name.to_string()))?;
        core.process(ShareEvent::InterfaceActiveChanged {
            status,
            downstream: machine,
        })
        .await
    }

    /// Queue a link status change without waiting for the lock. Safe from
    /// any thread, including OS callback contexts.
    pub fn notify_interface(&self, name: &str, status: InterfaceStatus) {
        let _ = self.inbox_tx.send(InboxMessage::Link {
            iface: name.to_string(),
            status,
        });
    }

    /// Process everything currently waiting in the inbox. Returns the number
    /// of messages handled.
    ///
    /// Waits while [`Coordinator::run`] is active, since that owns the inbox.
    pub async fn pump_pending(&self) -> usize {
        let mut inbox = self.inbox_rx.lock().await;
        let mut handled = 0;
        while let Ok(message) = inbox.try_recv() {
            self.deliver(message).await;
            handled += 1;
        }
        handled
    }

    /// Feed the inbox into the dispatcher. Runs until the task is aborted.
    pub async fn run(&self) {
        let mut inbox = self.inbox_rx.lock().await;
        while let Some(message) = inbox.recv().await {
            self.deliver(message).await;
        }
    }

    async fn deliver(&self, message: InboxMessage) {
        let result = match message {
            InboxMessage::Monitor { generation, event } => {
                let mut core = self.core.lock().await;
                if generation != core.generation {
                    debug!(kind = ?event.kind(), generation, "dropping event from a stale monitor subscription");
                    return;
                }
                core.process(event).await
            }
            InboxMessage::Link { iface, status } => self.interface_changed(&iface, status).await,
        };
        if let Err(e) = result {
            debug!("queued message rejected: {}", e);
        }
    }

    /// Tear everything down: stop the session, release forwarding, bring all
    /// downstream interfaces down and forget them.
    pub async fn shutdown(&self) {
        let mut core = self.core.lock().await;
        core.shutdown().await;
    }

    pub async fn status(&self) -> ShareStatus {
        self.core.lock().await.status()
    }

    pub async fn state(&self) -> CoordinatorState {
        self.core.lock().await.state
    }

    pub async fn has_set_forward(&self) -> bool {
        self.core.lock().await.session.has_set_forward()
    }

    pub async fn error_type(&self) -> Option<ShareErrorType> {
        self.core.lock().await.error_type
    }
}

impl CoordinatorCore {
    async fn process(&mut self, event: ShareEvent) -> Result<()> {
        let result = self.dispatch(event).await;
        self.drain().await;
        result
    }

    async fn drain(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            if let Err(e) = self.dispatch(event).await {
                debug!("internal event rejected: {}", e);
            }
        }
    }

    async fn dispatch(&mut self, event: ShareEvent) -> Result<()> {
        let kind = event.kind();
        let Some(row) = table::lookup(kind, self.state) else {
            debug!(?kind, state = %self.state, "no transition, event ignored");
            return Ok(());
        };

        debug!(?kind, state = %self.state, handler = ?row.handler, "dispatching");
        match self.invoke(row.handler, event).await {
            HandlerResult::Success => {
                if row.next != self.state {
                    self.main_sm_state_switch(row.next).await;
                }
                Ok(())
            }
            HandlerResult::Defer => {
                debug!(?kind, state = %self.state, "event deferred");
                Ok(())
            }
            HandlerResult::Rejected(e) => {
                info!(?kind, "request rejected: {}", e);
                Err(e)
            }
            HandlerResult::Fatal(error) => {
                self.switch_to_error_state(error).await;
                Err(NetShareError::SharingFailed { error })
            }
        }
    }

    /// Record `error` and enter Error. In Error already, only a non-trivial
    /// error replaces the recorded one.
    async fn switch_to_error_state(&mut self, error: ShareErrorType) {
        if self.state == CoordinatorState::Error {
            if !error.is_trivial() {
                self.error_type = Some(error);
            }
            return;
        }

        warn!(%error, from = %self.state, "switching to error state");
        self.error_type = Some(error);
        self.main_sm_state_switch(CoordinatorState::Error).await;
    }

    /// Exit hook of the current state, assignment, entry hook of the new one.
    async fn main_sm_state_switch(&mut self, new_state: CoordinatorState) {
        let old_state = self.state;
        let requester = self.session.requester.clone().unwrap_or_default();

        match old_state {
            CoordinatorState::Init => {}
            CoordinatorState::Alive => self.alive_state_exit().await,
            CoordinatorState::Error => {}
        }

        self.state = new_state;
        info!(from = %old_state, to = %new_state, "state switch");

        match new_state {
            CoordinatorState::Init => self.init_state_enter().await,
            CoordinatorState::Alive => self.alive_state_enter(),
            CoordinatorState::Error => self.error_state_enter().await,
        }

        let notification = match (old_state, new_state) {
            (CoordinatorState::Init, CoordinatorState::Alive) => {
                Some(ShareNotification::SharingStarted { requester })
            }
            (CoordinatorState::Alive, CoordinatorState::Init) => {
                Some(ShareNotification::SharingStopped { requester })
            }
            (CoordinatorState::Error, CoordinatorState::Init) => Some(ShareNotification::Recovered),
            (_, CoordinatorState::Error) => Some(ShareNotification::SharingError {
                error: self.error_type.unwrap_or(ShareErrorType::Unspecified),
            }),
            _ => None,
        };
        if let Some(notification) = notification {
            self.notify(notification);
        }
    }

    async fn init_state_enter(&mut self) {
        if self.session.has_set_forward() {
            warn!("forwarding still set on entering init");
            if let Err(e) = self.turn_off_main_share_settings().await {
                warn!("failed to remove forwarding: {}", e);
            }
        }
        self.session = SharingSession::default();
        self.error_type = None;
    }

    fn alive_state_enter(&mut self) {
        self.session.started_at = Some(chrono::Local::now());
        self.subscribe_monitor();
        self.pending.push_back(ShareEvent::UpstreamRecheck);
    }

    async fn alive_state_exit(&mut self) {
        if let Err(e) = self.turn_off_main_share_settings().await {
            warn!("failed to remove forwarding on leaving alive: {}", e);
        }
        if let Err(e) = self.deactivate_all().await {
            warn!("failed to deactivate downstreams on leaving alive: {}", e);
        }
        self.unsubscribe_monitor();
        self.session.upstream = None;
        self.session.release();
    }

    /// Single cleanup choke point; safe from any state and repeatable.
    async fn error_state_enter(&mut self) {
        if let Err(e) = self.turn_off_main_share_settings().await {
            warn!("failed to remove forwarding on error: {}", e);
        }
        if let Err(e) = self.deactivate_all().await {
            warn!("failed to deactivate downstreams on error: {}", e);
        }
        self.unsubscribe_monitor();
        self.session.upstream = None;
        self.session.release();

        if self.config.auto_clear_errors {
            self.pending.push_back(ShareEvent::ErrorClear);
        }
    }

    fn subscribe_monitor(&mut self) {
        let generation = self.generation + 1;
        let observer = Arc::new(InboxObserver {
            tx: self.inbox_tx.clone(),
            generation,
        });
        if self.monitor.subscribe(observer) {
            self.generation = generation;
        }
    }

    fn unsubscribe_monitor(&mut self) {
        self.monitor.unsubscribe();
        self.generation += 1;
    }

    /// Apply forwarding for every active downstream against the bound
    /// upstream. Idempotent. Pairs applied before a failure are rolled back.
    async fn turn_on_main_share_settings(&mut self) -> Result<()> {
        if self.session.has_set_forward() {
            return Ok(());
        }
        let Some(upstream) = self.session.upstream_iface().map(str::to_string) else {
            return Ok(());
        };
        let machines = self.downstreams.active_machines();
        if machines.is_empty() {
            return Ok(());
        }

        for (applied, machine) in machines.iter().enumerate() {
            if let Err(e) = machine.bind_upstream(&upstream).await {
                warn!(iface = machine.name(), %upstream, "failed to apply forwarding: {}", e);
                for done in &machines[..applied] {
                    if let Err(e) = done.unbind_upstream().await {
                        warn!(iface = done.name(), "rollback failed: {}", e);
                    }
                }
                return Err(e);
            }
        }

        self.session.set_forward(true);
        info!(%upstream, downstreams = machines.len(), "forwarding on");
        Ok(())
    }

    /// Remove every applied forwarding pair. Idempotent. The flag is cleared
    /// even when a removal fails; the failed pair stays recorded on its
    /// downstream for a later retry.
    async fn turn_off_main_share_settings(&mut self) -> Result<()> {
        let held: Vec<Arc<DownstreamStateMachine>> = self
            .downstreams
            .machines()
            .into_iter()
            .filter(|m| m.upstream().is_some())
            .collect();
        if !self.session.has_set_forward() && held.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for machine in held {
            if let Err(e) = machine.unbind_upstream().await {
                warn!(iface = machine.name(), "failed to remove forwarding: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.session.set_forward(false);
        info!("forwarding off");
        first_error.map_or(Ok(()), Err)
    }

    /// Activate one downstream and report the outcome back as an event.
    async fn activate_downstream(&mut self, machine: &Arc<DownstreamStateMachine>) -> Result<InterfaceStatus> {
        let status = machine.activate().await?;
        self.pending.push_back(ShareEvent::InterfaceActiveChanged {
            status,
            downstream: machine.clone(),
        });
        Ok(status)
    }

    /// Deactivate one downstream and report it inactive.
    async fn deactivate_downstream(&mut self, machine: &Arc<DownstreamStateMachine>) -> Result<()> {
        if machine.phase() == DownstreamPhase::Idle {
            self.downstreams.set_status(machine.name(), InterfaceStatus::Inactive);
            return Ok(());
        }
        machine.deactivate().await?;
        self.pending.push_back(ShareEvent::InterfaceActiveChanged {
            status: InterfaceStatus::Inactive,
            downstream: machine.clone(),
        });
        Ok(())
    }

    /// Deactivate every downstream, returning the first failure.
    async fn deactivate_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for machine in self.downstreams.machines() {
            if let Err(e) = self.deactivate_downstream(&machine).await {
                warn!(iface = machine.name(), "failed to deactivate: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn register(&mut self, name: &str) -> Result<()> {
        let machine = DownstreamStateMachine::new(
            name,
            self.control.clone(),
            self.forwarding.clone(),
            self.config.operation_timeout(),
            self.config.activation_retries,
        );
        self.downstreams.register(Arc::new(machine))?;
        info!(iface = name, "downstream registered");
        Ok(())
    }

    /// Drop bindings created for a request that was turned down. A binding
    /// whose interface cannot be brought down stays registered.
    async fn discard(&mut self, names: &[String]) {
        for name in names {
            let Some(machine) = self.downstreams.get(name).map(|b| b.machine.clone()) else {
                continue;
            };
            if let Err(e) = machine.deactivate().await {
                warn!(iface = %name, "failed to release downstream of a rejected request: {}", e);
                continue;
            }
            if self.downstreams.unregister(name).is_ok() {
                debug!(iface = %name, "downstream of a rejected request forgotten");
            }
        }
    }

    async fn unregister(&mut self, name: &str) -> Result<()> {
        let binding = self
            .downstreams
            .get(name)
            .cloned()
            .ok_or_else(|| NetShareError::UnknownInterface(name.to_string()))?;

        if let Err(e) = binding.machine.deactivate().await {
            let error = e.systemic_type(ShareErrorType::InterfaceControl);
            self.switch_to_error_state(error).await;
            return Err(e);
        }

        self.downstreams.unregister(name)?;
        info!(iface = name, "downstream unregistered");

        if self.state == CoordinatorState::Alive
            && binding.status == InterfaceStatus::Active
            && self.downstreams.active_count() == 0
        {
            self.pending.push_back(ShareEvent::SessionIdle);
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        match self.state {
            CoordinatorState::Alive | CoordinatorState::Init => {
                if let Some(requester) = self.session.requester.clone() {
                    if let Err(e) = self.process(ShareEvent::DisableRequest { requester }).await {
                        warn!("disable on shutdown failed: {}", e);
                    }
                }
            }
            CoordinatorState::Error => {
                if let Err(e) = self.process(ShareEvent::ErrorClear).await {
                    warn!("error clear on shutdown failed: {}", e);
                }
            }
        }

        if let Err(e) = self.turn_off_main_share_settings().await {
            warn!("failed to remove forwarding on shutdown: {}", e);
        }
        if let Err(e) = self.deactivate_all().await {
            warn!("failed to deactivate downstreams on shutdown: {}", e);
        }
        self.pending.clear();
        for machine in self.downstreams.machines() {
            let _ = self.downstreams.unregister(machine.name());
        }
        self.unsubscribe_monitor();
        info!(state = %self.state, "coordinator shut down");
    }

    fn status(&self) -> ShareStatus {
        ShareStatus {
            state: self.state,
            requester: self.session.requester.clone(),
            active_interfaces: self.downstreams.active_names(),
            current_upstream: self.session.upstream_iface().map(str::to_string),
            forwarding: self.session.has_set_forward(),
            error: self.error_type,
            since: self.session.started_at,
        }
    }

    fn notify(&self, notification: ShareNotification) {
        debug!(?notification, "notify");
        // No receivers is fine.
        let _ = self.notifier.send(notification);
    }
}
